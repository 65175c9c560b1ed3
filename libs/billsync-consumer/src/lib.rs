//! # Idempotent consumer
//!
//! Applies exactly the intended state change exactly once per natural key,
//! regardless of duplicate or out-of-order delivery. The broker gives
//! at-least-once delivery; this crate makes re-application of any envelope
//! a harmless no-op, which is what turns at-least-once delivery into
//! exactly-once application.
//!
//! ## Idempotency contract
//!
//! Per natural key:
//! - **CREATE** is applied at most once; a second CREATE for an existing
//!   key is acknowledged and discarded
//! - **UPDATE** is applied only if the keyed row exists; otherwise it is a
//!   reportable failure (dead-letter), never an insert
//! - **DELETE** of an absent key is success
//!
//! The natural key is normalized once, centrally, before any lookup
//! (see [`NaturalKey::normalized`]); consumers never compare raw wire
//! representations.
//!
//! Acknowledgement ordering is commit-then-ack: a consumer crash between
//! the two causes a redelivery, and the contract above absorbs it. The
//! reverse order could lose a delete or update outright.
//!
//! [`NaturalKey::normalized`]: billsync_envelope::NaturalKey::normalized

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use billsync_envelope::{Action, MessageEnvelope, Payload};

mod error;
pub mod metrics;
mod store;
mod worker;

pub use error::{ConsumerError, ConsumerResult};
pub use store::{SqlxClientStore, SqlxInvoiceStore};
pub use worker::{ConsumerWorker, DeliveryProcessor, Disposition};

/// The downstream service's own copy of the entity set, keyed by
/// normalized natural key.
///
/// Keys passed in are already normalized; implementations treat them as
/// opaque lookup values.
#[async_trait]
pub trait ConsumerStore: Send + Sync {
    async fn exists(&self, key: &str) -> ConsumerResult<bool>;

    /// Insert a new row for `key`. Only called after `exists` returned
    /// false; a concurrent duplicate surfaces as a constraint violation
    /// and dead-letters, which redelivery then absorbs as a duplicate.
    async fn insert(&self, key: &str, payload: &Payload) -> ConsumerResult<()>;

    /// Apply the non-absent payload fields to the row for `key`.
    /// Returns false when no such row exists.
    async fn update(&self, key: &str, payload: &Payload) -> ConsumerResult<bool>;

    /// Delete the row for `key`. Returns false when it was already absent.
    async fn delete(&self, key: &str) -> ConsumerResult<bool>;
}

/// How one envelope was disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    /// CREATE for a key that already exists: duplicate delivery, no-op
    DuplicateCreate,
    /// DELETE for a key that is already absent: success by definition
    AlreadyAbsent,
    /// Envelope's action is not the one this queue is dedicated to;
    /// acknowledged and discarded
    WrongAction,
}

impl ApplyOutcome {
    /// True for the outcomes that made no change because the state was
    /// already as requested.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApplyOutcome::DuplicateCreate | ApplyOutcome::AlreadyAbsent)
    }
}

/// Applies decoded envelopes to a [`ConsumerStore`] under the idempotency
/// contract. One applier serves one queue and therefore one expected
/// action.
pub struct IdempotentApplier<S: ConsumerStore> {
    store: Arc<S>,
    expected_action: Action,
}

impl<S: ConsumerStore> IdempotentApplier<S> {
    pub fn new(store: Arc<S>, expected_action: Action) -> Self {
        Self {
            store,
            expected_action,
        }
    }

    /// Apply one envelope. `Err` means the message must be dead-lettered;
    /// every `Ok` outcome is acknowledgeable.
    pub async fn apply(&self, envelope: &MessageEnvelope) -> ConsumerResult<ApplyOutcome> {
        if envelope.action != self.expected_action {
            // Indicates a routing misconfiguration upstream, not a
            // consumer bug. Discarding keeps the queue draining.
            warn!(
                action = %envelope.action,
                expected = %self.expected_action,
                natural_key = %envelope.natural_key,
                "Envelope action does not match this queue; discarding"
            );
            return Ok(ApplyOutcome::WrongAction);
        }

        let key = envelope.natural_key.normalized();

        match envelope.action {
            Action::Create => {
                if self.store.exists(&key).await? {
                    debug!(natural_key = %key, "Duplicate CREATE; already applied");
                    return Ok(ApplyOutcome::DuplicateCreate);
                }
                self.store.insert(&key, &envelope.payload).await?;
                info!(natural_key = %key, "Created");
                Ok(ApplyOutcome::Created)
            }
            Action::Update => {
                if self.store.update(&key, &envelope.payload).await? {
                    info!(natural_key = %key, "Updated");
                    Ok(ApplyOutcome::Updated)
                } else {
                    Err(ConsumerError::TargetNotFound(key))
                }
            }
            Action::Delete => {
                if self.store.delete(&key).await? {
                    info!(natural_key = %key, "Deleted");
                    Ok(ApplyOutcome::Deleted)
                } else {
                    debug!(natural_key = %key, "DELETE for absent key; nothing to do");
                    Ok(ApplyOutcome::AlreadyAbsent)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_envelope::{NaturalKey, UserPayload};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store mirroring the SQLx implementations closely enough
    /// to exercise the idempotency contract.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<String, UserPayload>>,
    }

    impl MemoryStore {
        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConsumerStore for MemoryStore {
        async fn exists(&self, key: &str) -> ConsumerResult<bool> {
            Ok(self.rows.lock().unwrap().contains_key(key))
        }

        async fn insert(&self, key: &str, payload: &Payload) -> ConsumerResult<()> {
            let Payload::User(user) = payload else {
                return Err(ConsumerError::PayloadMismatch);
            };
            self.rows
                .lock()
                .unwrap()
                .insert(key.to_string(), user.clone());
            Ok(())
        }

        async fn update(&self, key: &str, payload: &Payload) -> ConsumerResult<bool> {
            let Payload::User(user) = payload else {
                return Err(ConsumerError::PayloadMismatch);
            };
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(key) {
                Some(existing) => {
                    // Non-absent fields only, like the COALESCE update in
                    // the SQLx store.
                    if user.first_name.is_some() {
                        existing.first_name = user.first_name.clone();
                    }
                    if user.email.is_some() {
                        existing.email = user.email.clone();
                    }
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete(&self, key: &str) -> ConsumerResult<bool> {
            Ok(self.rows.lock().unwrap().remove(key).is_some())
        }
    }

    fn envelope(action: Action, key: &str) -> MessageEnvelope {
        MessageEnvelope {
            action,
            natural_key: NaturalKey::new(key).unwrap(),
            occurred_at: Utc.with_ymd_and_hms(2025, 4, 29, 14, 22, 28).unwrap(),
            payload: Payload::User(UserPayload {
                first_name: Some("John".to_string()),
                email: Some("john@example.com".to_string()),
                ..Default::default()
            }),
        }
    }

    fn applier(store: &Arc<MemoryStore>, action: Action) -> IdempotentApplier<MemoryStore> {
        IdempotentApplier::new(store.clone(), action)
    }

    #[tokio::test]
    async fn duplicate_create_leaves_exactly_one_row() {
        let store = Arc::new(MemoryStore::default());
        let applier = applier(&store, Action::Create);
        let envelope = envelope(Action::Create, "2025-04-29T14:22:27.816332Z");

        assert_eq!(applier.apply(&envelope).await.unwrap(), ApplyOutcome::Created);
        assert_eq!(store.row_count(), 1);

        // Second identical envelope: still exactly one row, unchanged.
        assert_eq!(
            applier.apply(&envelope).await.unwrap(),
            ApplyOutcome::DuplicateCreate
        );
        assert_eq!(store.row_count(), 1);

        let rows = store.rows.lock().unwrap();
        let row = rows.get("2025-04-29 14:22:27.816332").unwrap();
        assert_eq!(row.first_name.as_deref(), Some("John"));
        assert_eq!(row.email.as_deref(), Some("john@example.com"));
    }

    #[tokio::test]
    async fn update_for_unknown_key_is_rejected_without_mutation() {
        let store = Arc::new(MemoryStore::default());
        let applier = applier(&store, Action::Update);

        let result = applier.apply(&envelope(Action::Update, "X")).await;

        assert!(matches!(result, Err(ConsumerError::TargetNotFound(key)) if key == "X"));
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn update_applies_only_present_fields() {
        let store = Arc::new(MemoryStore::default());
        applier(&store, Action::Create)
            .apply(&envelope(Action::Create, "key-1"))
            .await
            .unwrap();

        let update = MessageEnvelope {
            payload: Payload::User(UserPayload {
                email: Some("new@example.com".to_string()),
                ..Default::default()
            }),
            ..envelope(Action::Update, "key-1")
        };
        assert_eq!(
            applier(&store, Action::Update).apply(&update).await.unwrap(),
            ApplyOutcome::Updated
        );

        let rows = store.rows.lock().unwrap();
        let row = rows.get("key-1").unwrap();
        // Absent field untouched, present field applied.
        assert_eq!(row.first_name.as_deref(), Some("John"));
        assert_eq!(row.email.as_deref(), Some("new@example.com"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        applier(&store, Action::Create)
            .apply(&envelope(Action::Create, "key-1"))
            .await
            .unwrap();

        let deleter = applier(&store, Action::Delete);
        assert_eq!(
            deleter.apply(&envelope(Action::Delete, "key-1")).await.unwrap(),
            ApplyOutcome::Deleted
        );
        // Deleting an already-absent key succeeds without error.
        assert_eq!(
            deleter.apply(&envelope(Action::Delete, "key-1")).await.unwrap(),
            ApplyOutcome::AlreadyAbsent
        );
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn redelivery_after_commit_is_a_noop() {
        // Simulates the crash window between local commit and broker ack:
        // the broker redelivers, and re-processing changes nothing.
        let store = Arc::new(MemoryStore::default());
        let deleter = applier(&store, Action::Delete);
        applier(&store, Action::Create)
            .apply(&envelope(Action::Create, "key-1"))
            .await
            .unwrap();

        deleter.apply(&envelope(Action::Delete, "key-1")).await.unwrap();
        let redelivered = deleter
            .apply(&envelope(Action::Delete, "key-1"))
            .await
            .unwrap();
        assert!(redelivered.is_duplicate());
    }

    #[tokio::test]
    async fn wrong_action_is_discarded_not_applied() {
        let store = Arc::new(MemoryStore::default());
        // A create queue receiving a DELETE envelope.
        let applier = applier(&store, Action::Create);

        let outcome = applier
            .apply(&envelope(Action::Delete, "key-1"))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::WrongAction);
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn lookups_use_the_normalized_key() {
        let store = Arc::new(MemoryStore::default());
        applier(&store, Action::Create)
            .apply(&envelope(Action::Create, "2025-04-29T14:22:27.816332Z"))
            .await
            .unwrap();

        // The same key in a different wire representation still hits the
        // same row.
        let outcome = applier(&store, Action::Create)
            .apply(&envelope(Action::Create, "2025-04-29 14:22:27.816332"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::DuplicateCreate);
        assert_eq!(store.row_count(), 1);
    }
}
