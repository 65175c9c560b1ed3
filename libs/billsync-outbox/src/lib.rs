//! # Transactional outbox, producer side
//!
//! Turns committed database state into durable outbound events without
//! losing them, and without duplicating them beyond what the consumer-side
//! idempotency layer absorbs.
//!
//! A change to the system of record lands as an [`OutboxEntry`] — either
//! written in the same transaction as the business change, or detected by
//! polling. The [`ChangePoller`] periodically scans for unprocessed
//! entries, oldest first, builds a [`MessageEnvelope`] for each, publishes
//! it via an [`EventPublisher`], and only after a confirmed publish marks
//! the entry processed.
//!
//! The database write (mark processed) and the broker write (publish) are
//! two separate systems. A crash between them re-emits the entry on the
//! next cycle; that duplicate is absorbed downstream by the natural-key
//! idempotency checks. The outbox itself is monotonic: an entry moves from
//! unprocessed to processed exactly once and never reverts — even the
//! operational replay tooling clones entries instead of flipping flags.
//!
//! Only one poller may be active per entity kind. Ordering of changes to
//! the same natural key is only as strong as the commit order feeding the
//! outbox, and two pollers racing on one kind would break it.
//!
//! [`MessageEnvelope`]: billsync_envelope::MessageEnvelope

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use billsync_envelope::{Action, EntityKind, NaturalKey};

mod error;
pub mod metrics;
mod poller;
mod publisher;
mod source;

pub use error::{OutboxError, OutboxResult};
pub use poller::{Backoff, ChangePoller, PollerConfig};
pub use publisher::{AmqpPublisher, EventPublisher, OutboundEvent};
pub use source::{ChangeSource, SourceRecord, SqlxClientSource, SqlxInvoiceSource};

/// One recorded change intent against one entity.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Row id of the entry itself
    pub id: i64,
    /// Numeric id of the changed entity in the system of record
    pub entity_id: i64,
    pub kind: EntityKind,
    pub action: Action,
    /// Natural-key snapshot. Required for DELETE entries (the source row is
    /// gone by publish time); filled in for other entries on first emission.
    pub natural_key: Option<String>,
    /// When the change was recorded; drives oldest-first ordering
    pub changed_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A change intent about to be recorded. Written inside the owning
/// transaction so the entry commits atomically with the business change.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub action: Action,
    pub natural_key: Option<NaturalKey>,
}

/// Storage for outbox entries.
///
/// Abstracted behind a trait so the poller can be exercised against an
/// in-memory implementation in tests.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Record a new unprocessed entry within the caller's transaction.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewOutboxEntry,
    ) -> OutboxResult<()>;

    /// Unprocessed entries of one kind, oldest first, capped at `limit`.
    async fn fetch_unprocessed(
        &self,
        kind: EntityKind,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEntry>>;

    /// Transition an entry to processed. Called only after a confirmed
    /// publish; the transition is one-way.
    async fn mark_processed(&self, entry_id: i64) -> OutboxResult<()>;

    /// Persist a natural-key snapshot onto an entry so retries and replays
    /// emit the same key even if the source row changes or disappears.
    async fn store_natural_key(&self, entry_id: i64, key: &NaturalKey) -> OutboxResult<()>;

    /// Pending count and age in seconds of the oldest unprocessed entry
    /// (zero when nothing is pending).
    async fn pending_stats(&self, kind: EntityKind) -> OutboxResult<(i64, i64)>;
}

/// SQLx-backed implementation of [`OutboxRepository`] on PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Re-emit processed entries recorded since `ts` by cloning them as
    /// fresh unprocessed entries. Cloning rather than un-marking keeps the
    /// unprocessed-to-processed transition monotonic. Operational backfill
    /// tool; consumers absorb the resulting duplicates.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO outbox_entries (entity_id, entity_kind, action, natural_key, changed_at)
            SELECT entity_id, entity_kind, action, natural_key, NOW()
            FROM outbox_entries
            WHERE processed AND changed_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> OutboxResult<OutboxEntry> {
    let kind: String = row.try_get("entity_kind")?;
    let action: String = row.try_get("action")?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        kind: kind.parse()?,
        action: Action::parse_wire(&action)?,
        natural_key: row.try_get("natural_key")?,
        changed_at: row.try_get("changed_at")?,
        processed: row.try_get("processed")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewOutboxEntry,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_entries (entity_id, entity_kind, action, natural_key, changed_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(entry.entity_id)
        .bind(entry.kind.as_str())
        .bind(entry.action.as_str())
        .bind(entry.natural_key.as_ref().map(|k| k.as_str().to_string()))
        .execute(&mut **tx)
        .await?;

        debug!(
            entity_id = entry.entity_id,
            kind = %entry.kind,
            action = %entry.action,
            "Outbox entry recorded"
        );

        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        kind: EntityKind,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, entity_kind, action, natural_key,
                   changed_at, processed, processed_at
            FROM outbox_entries
            WHERE entity_kind = $1 AND NOT processed
            ORDER BY changed_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<OutboxResult<Vec<_>>>()?;

        debug!(count = entries.len(), kind = %kind, "Fetched unprocessed entries");

        Ok(entries)
    }

    async fn mark_processed(&self, entry_id: i64) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET processed = TRUE, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(entry_id));
        }

        debug!(entry_id, "Outbox entry marked processed");

        Ok(())
    }

    async fn store_natural_key(&self, entry_id: i64, key: &NaturalKey) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET natural_key = $2
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(entry_id));
        }

        Ok(())
    }

    async fn pending_stats(&self, kind: EntityKind) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(changed_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_entries
            WHERE entity_kind = $1 AND NOT processed
            "#,
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let age: i64 = row.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}
