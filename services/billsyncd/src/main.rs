//! billsyncd: the change-propagation daemon.
//!
//! One binary, three roles selected by subcommand:
//!
//! ```text
//! billsyncd poller <kind>              run the outbox poller for one entity kind
//! billsyncd consumer <kind> <action>   consume one queue and apply changes locally
//! billsyncd replay <since>             re-emit processed entries since an RFC 3339 instant
//! ```
//!
//! Run exactly one poller per entity kind. Consumers scale horizontally;
//! the idempotency layer absorbs the duplicates that redelivery creates.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billsync_broker::BrokerConfig;
use billsync_consumer::{
    ConsumerStore, ConsumerWorker, DeliveryProcessor, IdempotentApplier, SqlxClientStore,
    SqlxInvoiceStore,
};
use billsync_consumer::metrics::ConsumerMetrics;
use billsync_envelope::{routing::ConsumerBinding, Action, EntityKind};
use billsync_outbox::metrics::PollerMetrics;
use billsync_outbox::{
    AmqpPublisher, ChangePoller, ChangeSource, PollerConfig, SqlxClientSource, SqlxInvoiceSource,
    SqlxOutboxRepository,
};

mod config;

use config::{DatabaseConfig, PipelineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billsyncd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("poller") => {
            let kind = parse_kind(args.get(2))?;
            run_poller(kind).await
        }
        Some("consumer") => {
            let kind = parse_kind(args.get(2))?;
            let action = parse_action(args.get(3))?;
            run_consumer(kind, action).await
        }
        Some("replay") => {
            let since = parse_since(args.get(2))?;
            run_replay(since).await
        }
        _ => {
            eprintln!("Usage: billsyncd <poller <kind> | consumer <kind> <action> | replay <since>>");
            eprintln!("  kind:   user | invoice");
            eprintln!("  action: create | update | delete");
            eprintln!("  since:  RFC 3339 instant, e.g. 2025-04-29T00:00:00Z");
            std::process::exit(2);
        }
    }
}

fn parse_kind(arg: Option<&String>) -> Result<EntityKind> {
    let raw = arg.context("missing <kind> argument (user | invoice)")?;
    raw.parse()
        .with_context(|| format!("unknown entity kind {raw:?}"))
}

fn parse_action(arg: Option<&String>) -> Result<Action> {
    let raw = arg.context("missing <action> argument (create | update | delete)")?;
    Action::parse_wire(raw).with_context(|| format!("unknown action {raw:?}"))
}

fn parse_since(arg: Option<&String>) -> Result<DateTime<Utc>> {
    let raw = arg.context("missing <since> argument (RFC 3339 instant)")?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid RFC 3339 instant {raw:?}"))?;
    Ok(parsed.with_timezone(&Utc))
}

async fn connect_pool(database: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(database.max_connections)
        .connect(&database.url)
        .await
        .context("Failed to create database pool")
}

/// Watch channel flipped to true on Ctrl-C. Both loop kinds drain their
/// in-flight work before honouring it.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

/// All queue bindings for one kind: every action for every consumer name.
fn all_bindings(kind: EntityKind, consumers: &[String]) -> Vec<ConsumerBinding> {
    let mut bindings = Vec::new();
    for consumer in consumers {
        for action in [Action::Create, Action::Update, Action::Delete] {
            bindings.push(ConsumerBinding::new(kind, action, consumer.clone()));
        }
    }
    bindings
}

async fn run_poller(kind: EntityKind) -> Result<()> {
    let database = DatabaseConfig::from_env()?;
    let pipeline = PipelineConfig::from_env();
    let broker = BrokerConfig::from_env();

    let pool = connect_pool(&database).await?;
    let connection = billsync_broker::connect(&broker)
        .await
        .context("Failed to connect to broker")?;
    let channel = billsync_broker::publisher_channel(&connection)
        .await
        .context("Failed to open publisher channel")?;
    billsync_broker::declare_topology(&channel, kind, &all_bindings(kind, &pipeline.consumers))
        .await
        .context("Failed to declare broker topology")?;

    let repository = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let publisher = Arc::new(AmqpPublisher::new(channel));
    let mut poller_config = PollerConfig::new(kind, pipeline.consumers);
    poller_config.batch_size = pipeline.batch_size;
    poller_config.poll_interval = pipeline.poll_interval;
    poller_config.failure_backoff = pipeline.failure_backoff;

    let shutdown = shutdown_signal();
    match kind {
        EntityKind::User => {
            let source = Arc::new(SqlxClientSource::new(pool));
            drive_poller(repository, source, publisher, poller_config, shutdown).await
        }
        EntityKind::Invoice => {
            let source = Arc::new(SqlxInvoiceSource::new(pool));
            drive_poller(repository, source, publisher, poller_config, shutdown).await
        }
    }
}

async fn drive_poller<S: ChangeSource>(
    repository: Arc<SqlxOutboxRepository>,
    source: Arc<S>,
    publisher: Arc<AmqpPublisher>,
    config: PollerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let metrics = PollerMetrics::new(config.kind.as_str());
    ChangePoller::new(repository, source, publisher, config)
        .with_metrics(metrics)
        .run(shutdown)
        .await
}

async fn run_consumer(kind: EntityKind, action: Action) -> Result<()> {
    let database = DatabaseConfig::from_env()?;
    let pipeline = PipelineConfig::from_env();
    let broker = BrokerConfig::from_env();

    let pool = connect_pool(&database).await?;
    let connection = billsync_broker::connect(&broker)
        .await
        .context("Failed to connect to broker")?;
    let channel = billsync_broker::consumer_channel(&connection)
        .await
        .context("Failed to open consumer channel")?;

    // The consumer declares the same topology as the poller so either side
    // can start first.
    let binding = ConsumerBinding::new(kind, action, pipeline.consumer_name.clone());
    billsync_broker::declare_topology(&channel, kind, std::slice::from_ref(&binding))
        .await
        .context("Failed to declare broker topology")?;

    let shutdown = shutdown_signal();
    match kind {
        EntityKind::User => {
            let store = Arc::new(SqlxClientStore::new(pool));
            drive_consumer(channel, binding, action, store, &pipeline, shutdown).await
        }
        EntityKind::Invoice => {
            let store = Arc::new(SqlxInvoiceStore::new(pool));
            drive_consumer(channel, binding, action, store, &pipeline, shutdown).await
        }
    }
}

async fn drive_consumer<S: ConsumerStore + 'static>(
    channel: lapin::Channel,
    binding: ConsumerBinding,
    action: Action,
    store: Arc<S>,
    pipeline: &PipelineConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let metrics = Arc::new(ConsumerMetrics::new(&pipeline.consumer_name));
    let processor = DeliveryProcessor::new(IdempotentApplier::new(store, action))
        .with_metrics(metrics);
    let worker = ConsumerWorker::new(
        channel,
        binding.queue_name(),
        format!("billsyncd-{}", pipeline.consumer_name),
        processor,
    );
    worker.run(shutdown).await?;
    Ok(())
}

async fn run_replay(since: DateTime<Utc>) -> Result<()> {
    let database = DatabaseConfig::from_env()?;
    let pool = connect_pool(&database).await?;
    let repository = SqlxOutboxRepository::new(pool);

    let count = repository.replay_since(since).await?;
    info!(since = %since, requeued = count, "Replay entries queued for re-emission");
    println!("Queued {count} entries recorded since {since} for re-emission");
    Ok(())
}
