//! Publisher seam between the poller and the broker.

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use tracing::debug;

use billsync_envelope::{routing, Action, EntityKind};

use crate::{OutboxError, OutboxResult};

/// Persistent delivery mode per the AMQP spec; the broker keeps the message
/// across its own restarts.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// One envelope addressed to one consumer.
#[derive(Debug)]
pub struct OutboundEvent<'a> {
    pub kind: EntityKind,
    pub action: Action,
    pub consumer: &'a str,
    /// Encoded envelope document
    pub body: &'a str,
}

impl OutboundEvent<'_> {
    pub fn exchange(&self) -> &'static str {
        routing::exchange_name(self.kind)
    }

    pub fn routing_key(&self) -> String {
        routing::routing_key(self.kind, self.action, self.consumer)
    }
}

/// Publishing seam. Implementations must only return `Ok` once the broker
/// has taken responsibility for the message, because the poller marks the
/// outbox entry processed on the strength of that return.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent<'_>) -> OutboxResult<()>;
}

/// AMQP implementation of [`EventPublisher`].
///
/// Requires a channel with publisher confirms enabled (see
/// `billsync_broker::publisher_channel`); a publish resolves only when the
/// broker acks it, and a broker nack is surfaced as an error so the entry
/// stays unprocessed.
pub struct AmqpPublisher {
    channel: Channel,
}

impl AmqpPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, event: &OutboundEvent<'_>) -> OutboxResult<()> {
        let routing_key = event.routing_key();
        let confirm = self
            .channel
            .basic_publish(
                event.exchange(),
                &routing_key,
                BasicPublishOptions::default(),
                event.body.as_bytes(),
                BasicProperties::default()
                    .with_content_type("application/xml".into())
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirm {
            return Err(OutboxError::PublishNacked { routing_key });
        }

        debug!(routing_key = %routing_key, "Publish confirmed");
        Ok(())
    }
}
