//! Error types for broker plumbing.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised while connecting to the broker or declaring topology.
///
/// A declaration conflict (existing exchange or queue with different
/// parameters) surfaces as [`BrokerError::Amqp`] and is deliberately not
/// retried: that is operator error, and the worker fails fast at startup.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// AMQP protocol or connection failure
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Broker URI could not be assembled from configuration
    #[error("invalid broker URI: {0}")]
    InvalidUri(String),
}
