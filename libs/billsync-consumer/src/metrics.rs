use prometheus::{IntCounter, Opts};
use tracing::warn;

/// Prometheus metrics for one consumer worker, registered against the
/// default registry and labelled with the consumer name.
#[derive(Clone)]
pub struct ConsumerMetrics {
    pub applied: IntCounter,
    pub duplicates: IntCounter,
    /// Misrouted envelopes acked and dropped, from the wrong-action check.
    pub discarded: IntCounter,
    pub dead_lettered: IntCounter,
}

impl ConsumerMetrics {
    pub fn new(consumer: &str) -> Self {
        let registry = prometheus::default_registry();

        let applied = IntCounter::with_opts(
            Opts::new(
                "billsync_consumer_applied_total",
                "Total number of envelopes applied to the local store",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for billsync_consumer_applied_total");

        let duplicates = IntCounter::with_opts(
            Opts::new(
                "billsync_consumer_duplicates_total",
                "Total number of redelivered envelopes absorbed as no-ops",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for billsync_consumer_duplicates_total");

        let discarded = IntCounter::with_opts(
            Opts::new(
                "billsync_consumer_discarded_total",
                "Total number of envelopes discarded for carrying the wrong action",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for billsync_consumer_discarded_total");

        let dead_lettered = IntCounter::with_opts(
            Opts::new(
                "billsync_consumer_dead_lettered_total",
                "Total number of envelopes nacked without requeue",
            )
            .const_label("consumer", consumer.to_string()),
        )
        .expect("valid metric opts for billsync_consumer_dead_lettered_total");

        for metric in [
            Box::new(applied.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(duplicates.clone()),
            Box::new(discarded.clone()),
            Box::new(dead_lettered.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Self {
            applied,
            duplicates,
            discarded,
            dead_lettered,
        }
    }
}
