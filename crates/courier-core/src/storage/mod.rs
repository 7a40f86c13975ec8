//! SQLite persistence for jobs, content items and destinations.
//!
//! The repository layer translates between domain models and rows. All SQL
//! lives in this module; callers only see typed repository methods.
//!
//! Timestamps are stored as integer microseconds since the UNIX epoch so
//! that range queries (`scheduled_for <= now`) compare numerically.

use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::debug;

pub mod content_items;
pub mod delivery_jobs;
pub mod destinations;

use crate::error::{CoreError, Result};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS content_items (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        format TEXT NOT NULL,
        author TEXT,
        source_url TEXT,
        platform TEXT,
        tags TEXT NOT NULL,
        media_urls TEXT NOT NULL,
        metadata TEXT NOT NULL,
        status TEXT NOT NULL,
        published_url TEXT,
        remote_id TEXT,
        destination_id TEXT,
        error TEXT,
        created_at INTEGER NOT NULL,
        published_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS destinations (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        auth TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        is_default INTEGER NOT NULL,
        total_published INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        last_sync INTEGER,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS delivery_jobs (
        id TEXT PRIMARY KEY NOT NULL,
        content_item_id TEXT NOT NULL,
        destination_id TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        last_error TEXT,
        skipped_reason TEXT,
        remote_id TEXT,
        published_url TEXT,
        created_at INTEGER NOT NULL,
        scheduled_for INTEGER,
        started_at INTEGER,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_dispatch
    ON delivery_jobs(status, priority DESC, created_at ASC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_pair
    ON delivery_jobs(content_item_id, destination_id, status)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_delivery_jobs_active_pair
    ON delivery_jobs(content_item_id, destination_id)
    WHERE status IN ('pending', 'processing')
    "#,
];

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Delivery job repository.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    /// Content item repository.
    pub content_items: Arc<content_items::Repository>,

    /// Destination repository.
    pub destinations: Arc<destinations::Repository>,

    pool: SqlitePool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Creates a storage instance over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        let shared = Arc::new(pool.clone());

        Self {
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(shared.clone())),
            content_items: Arc::new(content_items::Repository::new(shared.clone())),
            destinations: Arc::new(destinations::Repository::new(shared)),
            pool,
        }
    }

    /// Opens (creating if missing) the database at `url` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is malformed, the file cannot be opened or the
    /// schema cannot be created.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is
    /// limited to one connection.
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be created.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns error if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("storage schema ready");
        Ok(())
    }

    /// Verifies the database answers queries.
    ///
    /// # Errors
    ///
    /// Returns error if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn encode_time(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub(crate) fn encode_opt_time(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(encode_time)
}

pub(crate) fn decode_time(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| CoreError::Serialization(format!("timestamp out of range: {micros}")))
}

pub(crate) fn decode_opt_time(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(decode_time).transpose()
}

pub(crate) fn decode_opt_id<T: FromStr<Err = CoreError>>(value: Option<String>) -> Result<Option<T>> {
    value.as_deref().map(str::parse).transpose()
}
