//! Repository for destination configuration and delivery counters.
//!
//! Protocol settings and credentials are stored as JSON columns. Counters
//! are bumped with in-place arithmetic so concurrent completions never lose
//! an increment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use super::{decode_opt_time, decode_time, encode_opt_time, encode_time};
use crate::{
    error::{CoreError, Result},
    models::{Destination, DestinationId, DestinationStats},
};

const COLUMNS: &str = "id, name, kind, auth, enabled, is_default, total_published, failed_count, \
                       last_sync, created_at";

/// Repository for destination database operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Inserts a destination.
    ///
    /// # Errors
    ///
    /// Returns error if the id already exists or the insert fails.
    pub async fn insert(&self, destination: &Destination) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO destinations (
                id, name, kind, auth, enabled, is_default, total_published, failed_count,
                last_sync, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(destination.id.to_string())
        .bind(&destination.name)
        .bind(serde_json::to_string(&destination.kind)?)
        .bind(serde_json::to_string(&destination.auth)?)
        .bind(destination.enabled)
        .bind(destination.is_default)
        .bind(i64::try_from(destination.stats.total_published).unwrap_or(i64::MAX))
        .bind(i64::try_from(destination.stats.failed_count).unwrap_or(i64::MAX))
        .bind(encode_opt_time(destination.last_sync))
        .bind(encode_time(destination.created_at))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a destination by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the row is malformed.
    pub async fn find(&self, id: DestinationId) -> Result<Option<Destination>> {
        let sql = format!("SELECT {COLUMNS} FROM destinations WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&*self.pool).await?;
        row.as_ref().map(destination_from_row).transpose()
    }

    /// Lists all destinations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self) -> Result<Vec<Destination>> {
        let sql = format!("SELECT {COLUMNS} FROM destinations ORDER BY created_at ASC, rowid ASC");
        let rows = sqlx::query(&sql).fetch_all(&*self.pool).await?;
        rows.iter().map(destination_from_row).collect()
    }

    /// Enables or disables a destination.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the destination does not exist.
    pub async fn set_enabled(&self, id: DestinationId, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE destinations SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&*self.pool)
            .await?;
        ensure_found(result.rows_affected(), id)
    }

    /// Counts a successful delivery and stamps `last_sync`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the destination does not exist.
    pub async fn record_published(&self, id: DestinationId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE destinations SET total_published = total_published + 1, last_sync = ?1 \
             WHERE id = ?2",
        )
        .bind(encode_time(at))
        .bind(id.to_string())
        .execute(&*self.pool)
        .await?;
        ensure_found(result.rows_affected(), id)
    }

    /// Counts a terminal delivery failure.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the destination does not exist.
    pub async fn record_failure(&self, id: DestinationId) -> Result<()> {
        let result =
            sqlx::query("UPDATE destinations SET failed_count = failed_count + 1 WHERE id = ?1")
                .bind(id.to_string())
                .execute(&*self.pool)
                .await?;
        ensure_found(result.rows_affected(), id)
    }
}

fn ensure_found(rows_affected: u64, id: DestinationId) -> Result<()> {
    if rows_affected == 0 {
        return Err(CoreError::NotFound(format!("destination {id}")));
    }
    Ok(())
}

fn destination_from_row(row: &SqliteRow) -> Result<Destination> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let auth: String = row.try_get("auth")?;
    let total_published: i64 = row.try_get("total_published")?;
    let failed_count: i64 = row.try_get("failed_count")?;

    Ok(Destination {
        id: id.parse()?,
        name: row.try_get("name")?,
        kind: serde_json::from_str(&kind)?,
        auth: serde_json::from_str(&auth)?,
        enabled: row.try_get("enabled")?,
        is_default: row.try_get("is_default")?,
        stats: DestinationStats {
            total_published: u64::try_from(total_published).unwrap_or(0),
            failed_count: u64::try_from(failed_count).unwrap_or(0),
        },
        last_sync: decode_opt_time(row.try_get("last_sync")?)?,
        created_at: decode_time(row.try_get("created_at")?)?,
    })
}
