//! # Message Envelope Schema
//!
//! Shared wire-level types for the billsync pipeline: the canonical
//! [`MessageEnvelope`] that the change poller emits and every downstream
//! consumer decodes, the [`NaturalKey`] used for end-to-end deduplication,
//! and the routing-key conventions that bind producers to consumer queues.
//!
//! One crate owns the schema so that the producer and all consumers agree on
//! field layout and normalization. The wire format is XML with one root
//! element per entity kind (`UserMessage`, `InvoiceMessage`); see [`xml`].
//!
//! ## Envelope layout
//!
//! Every document carries, in order:
//!
//! 1. `ActionType` — CREATE | UPDATE | DELETE (case-insensitive on read,
//!    canonical uppercase on write)
//! 2. `UUID` — the natural key; consumers reject envelopes without one
//! 3. `TimeOfAction` — ISO-8601 UTC
//! 4. action-specific optional fields; absent fields are omitted, never
//!    emitted as empty elements, so an UPDATE payload naturally expresses
//!    "field not changed"

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

mod error;
pub mod routing;
pub mod xml;

pub use error::{EnvelopeError, EnvelopeResult};
pub use routing::ConsumerBinding;

/// The entity kinds flowing through the pipeline.
///
/// Each kind gets its own topic exchange and its own XML root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Invoice,
}

impl EntityKind {
    /// Lowercase name used in exchange names and routing keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Invoice => "invoice",
        }
    }

    /// XML root element for envelopes of this kind.
    pub fn root_element(&self) -> &'static str {
        match self {
            EntityKind::User => "UserMessage",
            EntityKind::Invoice => "InvoiceMessage",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EntityKind::User),
            "invoice" => Ok(EntityKind::Invoice),
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle action carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Canonical uppercase wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    /// Lowercase fragment used in routing keys (`user.create.billing`).
    pub fn routing_fragment(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parse the wire form. Case-insensitive: several event sources emit
    /// `Create` or `create` and all must be accepted.
    pub fn parse_wire(s: &str) -> EnvelopeResult<Self> {
        if s.eq_ignore_ascii_case("CREATE") {
            Ok(Action::Create)
        } else if s.eq_ignore_ascii_case("UPDATE") {
            Ok(Action::Update)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Action::Delete)
        } else {
            Err(EnvelopeError::UnknownAction(s.to_string()))
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, source-assigned identifier used to deduplicate events
/// independently of broker delivery semantics.
///
/// In practice this is either a UUID assigned when the entity was created,
/// or — for entities that predate natural-key adoption — an ISO-8601
/// creation timestamp with microsecond precision, synthesized once by the
/// poller and persisted back to the source so repeated polls agree.
///
/// Invariant: never empty, at most 255 characters (the storage column
/// width on both sides of the pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(value: impl Into<String>) -> EnvelopeResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(EnvelopeError::MissingNaturalKey);
        }
        if value.len() > 255 {
            return Err(EnvelopeError::NaturalKeyTooLong(value.len()));
        }
        Ok(Self(value))
    }

    /// Fresh random key, assigned by writing services at entity creation.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic key for entities that predate natural-key adoption:
    /// the creation timestamp, ISO-8601 with microseconds and a `Z` suffix.
    /// Deriving it twice from the same row yields the same key.
    pub fn from_creation_time(created_at: DateTime<Utc>) -> Self {
        Self(created_at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical form for storage lookups.
    ///
    /// Event sources disagree on timestamp representation: some emit a
    /// trailing `Z`, some a `T` separator. Both are normalized here, once,
    /// instead of per-field in every consumer.
    pub fn normalized(&self) -> String {
        let trimmed = self.0.strip_suffix('Z').unwrap_or(&self.0);
        trimmed.replace('T', " ")
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The wire-level unit: one lifecycle change to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub action: Action,
    pub natural_key: NaturalKey,
    pub occurred_at: DateTime<Utc>,
    pub payload: Payload,
}

impl MessageEnvelope {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// `occurred_at` in the wire form (`2025-04-29T14:22:27.816332Z`).
    pub fn occurred_at_wire(&self) -> String {
        self.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Action-specific payload fields. Every field is optional so that UPDATE
/// envelopes carry only what changed and DELETE envelopes carry nothing
/// beyond the natural key.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    User(UserPayload),
    Invoice(InvoicePayload),
}

impl Payload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::User(_) => EntityKind::User,
            Payload::Invoice(_) => EntityKind::Invoice,
        }
    }

    /// Empty payload of the given kind, used for DELETE envelopes.
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::User => Payload::User(UserPayload::default()),
            EntityKind::Invoice => Payload::Invoice(InvoicePayload::default()),
        }
    }
}

/// Personal and business fields of a client record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPayload {
    pub encrypted_password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub business: Option<BusinessFields>,
}

/// The optional `Business` sub-block of a user envelope. Present only when
/// the client has at least one business attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusinessFields {
    pub name: Option<String>,
    /// Falls back to the personal email when the source has no separate one.
    pub email: Option<String>,
    pub real_address: Option<String>,
    pub btw_number: Option<String>,
    /// Falls back to the real address when the source has no separate one.
    pub facturation_address: Option<String>,
}

impl BusinessFields {
    /// True when no field is set, in which case the whole `Business` element
    /// is omitted from the wire form.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.real_address.is_none()
            && self.btw_number.is_none()
            && self.facturation_address.is_none()
    }
}

/// Product line items of an invoice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoicePayload {
    pub products: Vec<ProductLine>,
}

/// One `Product` element. The unit price stays an opaque decimal string:
/// the layout is a serialization contract with the billing side, not a
/// format this pipeline interprets.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductLine {
    pub product_nr: String,
    pub quantity: u32,
    pub unit_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn action_parse_is_case_insensitive() {
        assert_eq!(Action::parse_wire("CREATE").unwrap(), Action::Create);
        assert_eq!(Action::parse_wire("update").unwrap(), Action::Update);
        assert_eq!(Action::parse_wire("Delete").unwrap(), Action::Delete);
        assert!(matches!(
            Action::parse_wire("UPSERT"),
            Err(EnvelopeError::UnknownAction(_))
        ));
    }

    #[test]
    fn natural_key_rejects_empty_and_oversized() {
        assert!(matches!(
            NaturalKey::new(""),
            Err(EnvelopeError::MissingNaturalKey)
        ));
        assert!(matches!(
            NaturalKey::new("   "),
            Err(EnvelopeError::MissingNaturalKey)
        ));
        assert!(matches!(
            NaturalKey::new("x".repeat(256)),
            Err(EnvelopeError::NaturalKeyTooLong(256))
        ));
        assert!(NaturalKey::new("x".repeat(255)).is_ok());
    }

    #[test]
    fn natural_key_normalization_strips_z_and_t() {
        let key = NaturalKey::new("2025-04-29T14:22:27.816332Z").unwrap();
        assert_eq!(key.normalized(), "2025-04-29 14:22:27.816332");

        // Plain UUIDs pass through untouched.
        let key = NaturalKey::new("8d3b1f9e-5a0c-4e0f-9dd1-2f6a4be9c001").unwrap();
        assert_eq!(key.normalized(), "8d3b1f9e-5a0c-4e0f-9dd1-2f6a4be9c001");
    }

    #[test]
    fn creation_time_key_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2025, 4, 29, 14, 22, 27).unwrap()
            + chrono::Duration::microseconds(816_332);
        let a = NaturalKey::from_creation_time(ts);
        let b = NaturalKey::from_creation_time(ts);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "2025-04-29T14:22:27.816332Z");
    }

    #[test]
    fn empty_business_block_is_detected() {
        assert!(BusinessFields::default().is_empty());
        let fields = BusinessFields {
            btw_number: Some("BE0123456789".to_string()),
            ..Default::default()
        };
        assert!(!fields.is_empty());
    }
}
