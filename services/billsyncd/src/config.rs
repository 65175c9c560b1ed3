//! Configuration management for billsyncd.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The broker settings live in [`billsync_broker::BrokerConfig`]; this
//! module covers the database pool and the pipeline knobs.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?,
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        })
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Downstream consumer names the poller fans out to
    pub consumers: Vec<String>,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub failure_backoff: Duration,
    /// Name this process consumes as (selects the queue to bind)
    pub consumer_name: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            consumers: std::env::var("PIPELINE_CONSUMERS")
                .unwrap_or_else(|_| "crm,kassa,frontend".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            batch_size: std::env::var("PIPELINE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            poll_interval: Duration::from_secs(
                std::env::var("PIPELINE_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            failure_backoff: Duration::from_secs(
                std::env::var("PIPELINE_FAILURE_BACKOFF_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            consumer_name: std::env::var("PIPELINE_CONSUMER_NAME")
                .unwrap_or_else(|_| "crm".to_string()),
        }
    }
}
