//! Queue consumption loop: decode, apply, acknowledge.
//!
//! The logic is split in two. [`DeliveryProcessor`] owns everything that
//! can be decided from a message body alone (decode, apply, metrics) and
//! maps every failure to a [`Disposition`] instead of an error.
//! [`ConsumerWorker`] owns the broker plumbing: one queue, one channel
//! (prefetch 1), and the acknowledgement discipline. Ack only after the
//! local commit succeeded; nack without requeue on any failure so the
//! broker's dead-letter exchange captures the message instead of cycling
//! it through the queue forever.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::watch;
use tracing::{error, info, warn};

use billsync_envelope::xml;

use crate::metrics::ConsumerMetrics;
use crate::{ApplyOutcome, ConsumerStore, IdempotentApplier};

/// What to tell the broker about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack without requeue; the queue's dead-letter exchange takes it.
    Reject,
}

/// Turns one raw message body into a [`Disposition`]. Holds no broker
/// state, so the full decode-and-apply path is exercisable in unit tests.
pub struct DeliveryProcessor<S: ConsumerStore> {
    applier: IdempotentApplier<S>,
    metrics: Option<Arc<ConsumerMetrics>>,
}

impl<S: ConsumerStore> DeliveryProcessor<S> {
    pub fn new(applier: IdempotentApplier<S>) -> Self {
        Self {
            applier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decode and apply one message body. Infallible in the Rust sense:
    /// every failure maps to a disposition, never a worker crash.
    pub async fn process(&self, body: &[u8], routing_key: &str) -> Disposition {
        let envelope = match xml::decode(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                // The raw body goes into the log because the dead-letter
                // queue is the only other place it will exist.
                error!(
                    routing_key,
                    error = %err,
                    body = %String::from_utf8_lossy(body),
                    "Undecodable message"
                );
                return self.reject();
            }
        };

        match self.applier.apply(&envelope).await {
            Ok(outcome) => {
                if let Some(metrics) = &self.metrics {
                    match outcome {
                        ApplyOutcome::WrongAction => metrics.discarded.inc(),
                        outcome if outcome.is_duplicate() => metrics.duplicates.inc(),
                        _ => metrics.applied.inc(),
                    }
                }
                Disposition::Ack
            }
            Err(err) => {
                error!(
                    routing_key,
                    natural_key = %envelope.natural_key,
                    action = %envelope.action,
                    error = %err,
                    "Failed to apply message"
                );
                self.reject()
            }
        }
    }

    fn reject(&self) -> Disposition {
        if let Some(metrics) = &self.metrics {
            metrics.dead_lettered.inc();
        }
        Disposition::Reject
    }
}

pub struct ConsumerWorker<S: ConsumerStore> {
    channel: Channel,
    queue: String,
    consumer_tag: String,
    processor: DeliveryProcessor<S>,
}

impl<S: ConsumerStore> ConsumerWorker<S> {
    pub fn new(
        channel: Channel,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        processor: DeliveryProcessor<S>,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            processor,
        }
    }

    /// Consume until the shutdown signal flips. The in-flight delivery is
    /// always disposed of before the loop exits, so a drained worker never
    /// leaves an unacked message behind.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::ConsumerResult<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue, "Consumer started");

        loop {
            tokio::select! {
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle(delivery).await?,
                        Some(Err(err)) => {
                            error!(queue = %self.queue, error = %err, "Delivery stream error");
                            return Err(err.into());
                        }
                        None => {
                            warn!(queue = %self.queue, "Delivery stream closed by broker");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue = %self.queue, "Consumer stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) -> crate::ConsumerResult<()> {
        let routing_key = delivery.routing_key.as_str().to_string();
        match self.processor.process(&delivery.data, &routing_key).await {
            Disposition::Ack => {
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Disposition::Reject => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConsumerResult;
    use async_trait::async_trait;
    use billsync_envelope::{
        Action, MessageEnvelope, NaturalKey, Payload, UserPayload,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct KeySetStore {
        keys: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl ConsumerStore for KeySetStore {
        async fn exists(&self, key: &str) -> ConsumerResult<bool> {
            Ok(self.keys.lock().unwrap().contains(key))
        }

        async fn insert(&self, key: &str, _payload: &Payload) -> ConsumerResult<()> {
            self.keys.lock().unwrap().insert(key.to_string());
            Ok(())
        }

        async fn update(&self, key: &str, _payload: &Payload) -> ConsumerResult<bool> {
            Ok(self.keys.lock().unwrap().contains(key))
        }

        async fn delete(&self, key: &str) -> ConsumerResult<bool> {
            Ok(self.keys.lock().unwrap().remove(key))
        }
    }

    fn wire_body(action: Action, key: &str) -> Vec<u8> {
        let envelope = MessageEnvelope {
            action,
            natural_key: NaturalKey::new(key).unwrap(),
            occurred_at: Utc.with_ymd_and_hms(2025, 4, 29, 14, 22, 28).unwrap(),
            payload: Payload::User(UserPayload {
                first_name: Some("John".to_string()),
                ..Default::default()
            }),
        };
        xml::encode(&envelope).unwrap().into_bytes()
    }

    fn processor(
        expected_action: Action,
        metrics_label: &str,
    ) -> (DeliveryProcessor<KeySetStore>, Arc<ConsumerMetrics>) {
        let metrics = Arc::new(ConsumerMetrics::new(metrics_label));
        let applier = IdempotentApplier::new(Arc::new(KeySetStore::default()), expected_action);
        (
            DeliveryProcessor::new(applier).with_metrics(metrics.clone()),
            metrics,
        )
    }

    #[tokio::test]
    async fn undecodable_body_is_rejected_and_dead_lettered() {
        let (processor, metrics) = processor(Action::Create, "test-undecodable");

        let disposition = processor.process(b"not an envelope", "user.create.crm").await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(metrics.dead_lettered.get(), 1);
        assert_eq!(metrics.applied.get(), 0);
    }

    #[tokio::test]
    async fn update_of_unknown_key_is_rejected_with_one_dead_letter() {
        let (processor, metrics) = processor(Action::Update, "test-unknown-update");

        let body = wire_body(Action::Update, "2025-04-29T14:22:27.816332Z");
        let disposition = processor.process(&body, "user.update.crm").await;

        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(metrics.dead_lettered.get(), 1);
        assert_eq!(metrics.applied.get(), 0);
    }

    #[tokio::test]
    async fn wrong_action_is_acked_as_discarded_not_applied() {
        let (processor, metrics) = processor(Action::Create, "test-wrong-action");

        let body = wire_body(Action::Delete, "key-1");
        let disposition = processor.process(&body, "user.delete.crm").await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(metrics.discarded.get(), 1);
        assert_eq!(metrics.applied.get(), 0);
        assert_eq!(metrics.duplicates.get(), 0);
    }

    #[tokio::test]
    async fn applied_and_duplicate_envelopes_are_acked_and_counted() {
        let (processor, metrics) = processor(Action::Create, "test-applied");

        let body = wire_body(Action::Create, "key-1");
        assert_eq!(processor.process(&body, "user.create.crm").await, Disposition::Ack);
        assert_eq!(metrics.applied.get(), 1);

        // Redelivery of the same CREATE counts as a duplicate, not applied.
        assert_eq!(processor.process(&body, "user.create.crm").await, Disposition::Ack);
        assert_eq!(metrics.applied.get(), 1);
        assert_eq!(metrics.duplicates.get(), 1);
        assert_eq!(metrics.dead_lettered.get(), 0);
    }
}
