//! Error types for the outbox producer side.

use billsync_envelope::{Action, EnvelopeError};
use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur while polling the outbox and publishing changes.
///
/// Any of these failing a cycle leaves the affected entries unprocessed;
/// the next cycle retries them. There is deliberately no per-entry retry
/// counter: a permanently unserializable row is retried forever and must be
/// fixed at the source.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Broker operation failed
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// The broker refused responsibility for a publish
    #[error("publish to {routing_key} was nacked by the broker")]
    PublishNacked { routing_key: String },

    /// Outbox entry references an entity row that no longer exists
    #[error("outbox entry {entry_id} references missing entity {entity_id}")]
    EntityMissing { entry_id: i64, entity_id: i64 },

    /// A DELETE entry carried no natural-key snapshot to emit against
    #[error("outbox entry {entry_id} has no natural-key snapshot for {action}")]
    MissingKeySnapshot { entry_id: i64, action: Action },

    /// Entry not found when marking processed
    #[error("outbox entry not found: {0}")]
    EntryNotFound(i64),

    /// Envelope could not be built or encoded
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Generic error with context
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
