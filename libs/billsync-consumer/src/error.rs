//! Error types for the consumer side.

use billsync_envelope::EnvelopeError;
use thiserror::Error;

/// Result type alias for consumer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised while applying an envelope to the local store.
///
/// Everything here is fatal for the message in hand: the worker nacks
/// without requeue and the broker dead-letters it. Retrying would not
/// change the outcome, so retries for this class of failure happen at the
/// ops layer, not in the consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Broker operation failed
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// Envelope could not be decoded
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// UPDATE target does not exist. Never silently insert on UPDATE:
    /// that would fabricate a record from partial data.
    #[error("no row for natural key {0:?}; refusing to apply UPDATE")]
    TargetNotFound(String),

    /// Envelope payload kind does not match this store
    #[error("payload kind does not match this consumer's store")]
    PayloadMismatch,

    /// Generic error with context
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
