//! Routing conventions for the broker topology.
//!
//! One topic exchange per entity kind; one durable queue per
//! (kind, action, consumer) triple; binding keys of the form
//! `<kind>.<action>.<consumer>`, all lowercase, dot-separated.
//! Exchanges are topic-typed so future consumers can subscribe with
//! wildcards without producer changes.

use crate::{Action, EntityKind};

/// Exchange carrying all events of one entity kind.
pub fn exchange_name(kind: EntityKind) -> &'static str {
    kind.as_str()
}

/// Dead-letter exchange for one entity kind. Queues of that kind declare it
/// as their `x-dead-letter-exchange`, so nacked-without-requeue messages
/// land in the holding queue for operator triage.
pub fn dead_letter_exchange(kind: EntityKind) -> String {
    format!("{}.dlx", kind.as_str())
}

/// Holding queue fed by the dead-letter exchange of one entity kind.
pub fn dead_letter_queue(kind: EntityKind) -> String {
    format!("{}_dead_letter", kind.as_str())
}

/// One consumer's subscription to one (kind, action) event stream.
///
/// The binding fully determines queue name and routing key, which keeps the
/// topology deterministic and inspectable: given a queue name an operator
/// can read off exactly which events feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerBinding {
    pub kind: EntityKind,
    pub action: Action,
    /// Downstream service name, e.g. "crm", "kassa", "frontend".
    pub consumer: String,
}

impl ConsumerBinding {
    pub fn new(kind: EntityKind, action: Action, consumer: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            consumer: consumer.into(),
        }
    }

    /// Routing key this binding subscribes to, e.g. `user.create.crm`.
    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.kind.as_str(),
            self.action.routing_fragment(),
            self.consumer
        )
    }

    /// Durable queue name, e.g. `crm_user_create`.
    pub fn queue_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.consumer,
            self.kind.as_str(),
            self.action.routing_fragment()
        )
    }
}

/// Routing key for a publish to one consumer, e.g. `invoice.create.kassa`.
pub fn routing_key(kind: EntityKind, action: Action, consumer: &str) -> String {
    format!("{}.{}.{}", kind.as_str(), action.routing_fragment(), consumer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_is_lowercase_dot_separated() {
        assert_eq!(
            routing_key(EntityKind::User, Action::Create, "billing"),
            "user.create.billing"
        );
        assert_eq!(
            routing_key(EntityKind::Invoice, Action::Delete, "kassa"),
            "invoice.delete.kassa"
        );
    }

    #[test]
    fn binding_derives_queue_and_key() {
        let binding = ConsumerBinding::new(EntityKind::User, Action::Update, "crm");
        assert_eq!(binding.routing_key(), "user.update.crm");
        assert_eq!(binding.queue_name(), "crm_user_update");
    }

    #[test]
    fn dead_letter_names_follow_kind() {
        assert_eq!(dead_letter_exchange(EntityKind::User), "user.dlx");
        assert_eq!(dead_letter_queue(EntityKind::Invoice), "invoice_dead_letter");
    }
}
