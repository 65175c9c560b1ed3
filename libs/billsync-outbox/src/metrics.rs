use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Prometheus metrics for one poller instance, registered against the
/// default registry. Labelled by entity kind since one process runs at most
/// one poller per kind.
#[derive(Clone)]
pub struct PollerMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub published: IntCounter,
    pub cycle_failures: IntCounter,
}

impl PollerMetrics {
    pub fn new(kind: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "billsync_outbox_pending_count",
                "Number of unprocessed outbox entries currently pending",
            )
            .const_label("kind", kind.to_string()),
        )
        .expect("valid metric opts for billsync_outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "billsync_outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest unprocessed outbox entry",
            )
            .const_label("kind", kind.to_string()),
        )
        .expect("valid metric opts for billsync_outbox_oldest_pending_age_seconds");

        let published = IntCounter::with_opts(
            Opts::new(
                "billsync_outbox_published_total",
                "Total number of outbox entries published and marked processed",
            )
            .const_label("kind", kind.to_string()),
        )
        .expect("valid metric opts for billsync_outbox_published_total");

        let cycle_failures = IntCounter::with_opts(
            Opts::new(
                "billsync_poller_cycle_failures_total",
                "Total number of poll cycles that ended in an error",
            )
            .const_label("kind", kind.to_string()),
        )
        .expect("valid metric opts for billsync_poller_cycle_failures_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(published.clone()),
            Box::new(cycle_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register poller metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            published,
            cycle_failures,
        }
    }
}
