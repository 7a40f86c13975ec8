//! Configuration for the courier delivery service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use courier_delivery::{client::ClientConfig, ConflictPolicy, QueueConfig, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";
const ENV_PREFIX: &str = "COURIER_";

/// Service configuration with defaults, file, and environment overrides.
///
/// Sources in priority order, highest first:
/// 1. Environment variables prefixed with `COURIER_` (`COURIER_MAX_CONCURRENT`)
/// 2. `courier.toml` in the working directory
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Storage
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Scheduler
    /// Jobs processing at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Scheduler tick in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds after which an unowned `processing` job is recovered.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// `skip`, `overwrite` or `create-new`.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    // Retry
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Backoff growth per retry.
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// Jitter width as a percentage of the delay.
    #[serde(default = "default_jitter_percent")]
    pub retry_jitter_percent: f64,

    // Publishing
    /// Per-request timeout for HTTP publishers in seconds.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    // Maintenance
    /// Finished jobs older than this many days are purged. 0 disables.
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u64,

    // Logging
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads and validates configuration from every source.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Provider chain used by [`load`](Self::load).
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Scheduler settings.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
            conflict_policy: self.conflict_policy,
        }
    }

    /// Backoff policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            jitter_percent: self.retry_jitter_percent,
        }
    }

    /// HTTP client settings shared by the publishers.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.publish_timeout_secs),
            ..ClientConfig::default()
        }
    }

    /// Retention for finished jobs, `None` when purging is disabled.
    pub fn purge_after(&self) -> Option<Duration> {
        (self.purge_after_days > 0).then(|| Duration::from_secs(self.purge_after_days * 86_400))
    }

    fn validate(&self) -> Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            bail!("database_url must be a sqlite: URL");
        }

        if self.database_max_connections == 0 {
            bail!("database_max_connections must be greater than 0");
        }

        if self.max_concurrent == 0 {
            bail!("max_concurrent must be greater than 0");
        }

        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than 0");
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            bail!("retry_max_delay_ms cannot be less than retry_base_delay_ms");
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            bail!("retry_backoff_multiplier must be at least 1.0");
        }

        if !(0.0..=100.0).contains(&self.retry_jitter_percent) {
            bail!("retry_jitter_percent must be between 0 and 100");
        }

        if self.publish_timeout_secs == 0 {
            bail!("publish_timeout_secs must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_secs: default_stale_after_secs(),
            conflict_policy: ConflictPolicy::default(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_jitter_percent: default_jitter_percent(),
            publish_timeout_secs: default_publish_timeout(),
            purge_after_days: default_purge_after_days(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://courier.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_concurrent() -> usize {
    courier_delivery::DEFAULT_MAX_CONCURRENT
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    courier_delivery::DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_percent() -> f64 {
    20.0
}

fn default_publish_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_purge_after_days() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
