//! The change poller: the producer half of the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use billsync_envelope::{xml, Action, EntityKind, MessageEnvelope, NaturalKey, Payload};

use crate::metrics::PollerMetrics;
use crate::{ChangeSource, EventPublisher, OutboundEvent, OutboxError, OutboxRepository, OutboxResult};

/// Poller settings. One poller owns one entity kind; running two pollers on
/// the same kind would let a CREATE and a fast-following UPDATE to the same
/// key be picked up out of order.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub kind: EntityKind,
    /// Downstream consumer names; each publish fans out to every one
    pub consumers: Vec<String>,
    /// Maximum entries per cycle
    pub batch_size: i64,
    /// Sleep between clean cycles
    pub poll_interval: Duration,
    /// Sleep after a cycle that errored
    pub failure_backoff: Duration,
}

impl PollerConfig {
    pub fn new(kind: EntityKind, consumers: Vec<String>) -> Self {
        Self {
            kind,
            consumers,
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(60),
        }
    }
}

/// Two-state backoff for the poll loop: the normal interval on success, the
/// degraded interval after a cycle-level failure, back to normal on the
/// next clean cycle. Kept as an explicit value so the transition logic is
/// testable without real time.
#[derive(Debug)]
pub struct Backoff {
    normal: Duration,
    degraded: Duration,
    last_failed: bool,
}

impl Backoff {
    pub fn new(normal: Duration, degraded: Duration) -> Self {
        Self {
            normal,
            degraded,
            last_failed: false,
        }
    }

    pub fn on_success(&mut self) {
        self.last_failed = false;
    }

    pub fn on_failure(&mut self) {
        self.last_failed = true;
    }

    pub fn delay(&self) -> Duration {
        if self.last_failed {
            self.degraded
        } else {
            self.normal
        }
    }
}

/// Periodically scans the outbox for unprocessed entries and publishes
/// them, oldest first.
///
/// A publish failure stops the cycle at the failing entry: everything
/// before it is processed, the failing entry and everything after remain
/// unprocessed for the next cycle. This is the sole retry mechanism. There
/// is no per-entry retry counter, so a permanently unserializable row is
/// retried forever and must be fixed at the source.
pub struct ChangePoller<R, S, P>
where
    R: OutboxRepository,
    S: ChangeSource,
    P: EventPublisher,
{
    repository: Arc<R>,
    source: Arc<S>,
    publisher: Arc<P>,
    config: PollerConfig,
    metrics: Option<PollerMetrics>,
}

impl<R, S, P> ChangePoller<R, S, P>
where
    R: OutboxRepository,
    S: ChangeSource,
    P: EventPublisher,
{
    pub fn new(repository: Arc<R>, source: Arc<S>, publisher: Arc<P>, config: PollerConfig) -> Self {
        Self {
            repository,
            source,
            publisher,
            config,
            metrics: None,
        }
    }

    /// Attach Prometheus metrics, updated once per cycle.
    pub fn with_metrics(mut self, metrics: PollerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until the shutdown flag flips. An in-flight cycle always
    /// completes before the loop exits, so no publish is abandoned between
    /// broker confirm and mark-processed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            kind = %self.config.kind,
            consumers = ?self.config.consumers,
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Change poller starting"
        );

        let mut backoff = Backoff::new(self.config.poll_interval, self.config.failure_backoff);

        loop {
            match self.run_cycle().await {
                Ok(0) => {
                    debug!("No unprocessed changes");
                    backoff.on_success();
                }
                Ok(count) => {
                    info!(published_count = count, "Published changes from outbox");
                    backoff.on_success();
                }
                Err(e) => {
                    error!(error = ?e, "Poller cycle failed");
                    if let Some(m) = &self.metrics {
                        m.cycle_failures.inc();
                    }
                    backoff.on_failure();
                }
            }

            if let Some(m) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats(self.config.kind).await {
                    m.pending.set(pending);
                    m.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.delay()) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!(kind = %self.config.kind, "Change poller stopped");
        Ok(())
    }

    /// One poll cycle. Returns the number of entries published and marked
    /// processed.
    async fn run_cycle(&self) -> OutboxResult<usize> {
        let entries = self
            .repository
            .fetch_unprocessed(self.config.kind, self.config.batch_size)
            .await?;

        let mut published = 0usize;
        for entry in &entries {
            let envelope = self.build_envelope(entry).await?;
            let body = xml::encode(&envelope)?;

            for consumer in &self.config.consumers {
                // An error here aborts the cycle: this entry and everything
                // after it stay unprocessed. A consumer that already got
                // its copy sees a duplicate next cycle and no-ops on it.
                self.publisher
                    .publish(&OutboundEvent {
                        kind: self.config.kind,
                        action: entry.action,
                        consumer,
                        body: &body,
                    })
                    .await?;
            }

            self.repository.mark_processed(entry.id).await?;
            if let Some(m) = &self.metrics {
                m.published.inc();
            }
            published += 1;

            info!(
                entry_id = entry.id,
                entity_id = entry.entity_id,
                action = %entry.action,
                natural_key = %envelope.natural_key,
                "Change published"
            );
        }

        Ok(published)
    }

    async fn build_envelope(&self, entry: &crate::OutboxEntry) -> OutboxResult<MessageEnvelope> {
        // DELETE entries must carry a key snapshot taken while the row
        // still existed; the source row is gone by publish time.
        if entry.action == Action::Delete {
            let snapshot = entry
                .natural_key
                .as_deref()
                .ok_or(OutboxError::MissingKeySnapshot {
                    entry_id: entry.id,
                    action: entry.action,
                })?;
            return Ok(MessageEnvelope {
                action: Action::Delete,
                natural_key: NaturalKey::new(snapshot)?,
                occurred_at: entry.changed_at,
                payload: Payload::empty(self.config.kind),
            });
        }

        let record = self.source.load(entry).await?;
        let natural_key = self.resolve_natural_key(entry, &record).await?;

        Ok(MessageEnvelope {
            action: entry.action,
            natural_key,
            occurred_at: entry.changed_at,
            payload: record.payload,
        })
    }

    /// Natural-key resolution order: the entry's own snapshot, then the
    /// key stored on the entity, then deterministic synthesis from the
    /// creation timestamp. A synthesized key is persisted to both the
    /// entity and the entry before first use, so a crash mid-cycle cannot
    /// produce two keys for one entity.
    async fn resolve_natural_key(
        &self,
        entry: &crate::OutboxEntry,
        record: &crate::SourceRecord,
    ) -> OutboxResult<NaturalKey> {
        if let Some(snapshot) = &entry.natural_key {
            return Ok(NaturalKey::new(snapshot.clone())?);
        }

        if let Some(key) = &record.natural_key {
            // Snapshot onto the entry so later retries no longer depend on
            // the source row.
            self.repository.store_natural_key(entry.id, key).await?;
            return Ok(key.clone());
        }

        let key = NaturalKey::from_creation_time(record.created_at);
        warn!(
            entity_id = entry.entity_id,
            natural_key = %key,
            "Entity predates natural-key adoption; synthesized key from creation time"
        );
        self.source.store_natural_key(entry.entity_id, &key).await?;
        self.repository.store_natural_key(entry.id, &key).await?;
        Ok(key)
    }
}
