//! Error types for envelope encoding and decoding.

use thiserror::Error;

/// Result type alias for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Errors that can occur while building, encoding or decoding a message
/// envelope. All of these are fatal for the message in question: a consumer
/// that hits one nacks without requeue so the message is dead-lettered.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// XML (de)serialization failed
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// Low-level XML read failed while sniffing the document root
    #[error("XML read error: {0}")]
    XmlRead(#[from] quick_xml::Error),

    /// Message body is not valid UTF-8
    #[error("message body is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// Envelope carried no natural key, or an empty one
    #[error("natural key is missing or empty")]
    MissingNaturalKey,

    /// Natural key exceeds the storage column width
    #[error("natural key too long: {0} characters (max 255)")]
    NaturalKeyTooLong(usize),

    /// ActionType element held something other than CREATE/UPDATE/DELETE
    #[error("unknown action type: {0:?}")]
    UnknownAction(String),

    /// Document root did not name a known entity kind
    #[error("unknown message root element: {0:?}")]
    UnknownRoot(String),

    /// Entity kind string did not name a known kind
    #[error("unknown entity kind: {0:?}")]
    UnknownKind(String),

    /// TimeOfAction element was not a parseable ISO-8601 timestamp
    #[error("bad TimeOfAction {value:?}: {source}")]
    BadTimestamp {
        value: String,
        source: chrono::ParseError,
    },
}
