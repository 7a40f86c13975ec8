//! Repository for delivery job rows.
//!
//! Every write touches exactly one row in one statement, so concurrent
//! updates to different jobs never interfere. Claiming is a conditional
//! update (`pending → processing`) that succeeds for at most one caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};

use super::{decode_opt_time, decode_time, encode_opt_time, encode_time};
use crate::{
    error::{CoreError, Result},
    models::{
        ContentItemId, DeliveryJob, DestinationId, JobId, JobStatus, JobUpdate, Priority,
        StatusCounts,
    },
};

const COLUMNS: &str = "id, content_item_id, destination_id, status, priority, retry_count, \
                       max_retries, last_error, skipped_reason, remote_id, published_url, \
                       created_at, scheduled_for, started_at, completed_at";

const DISPATCH_ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

/// Repository for delivery job database operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Inserts a new job.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if an active job already exists for the
    /// same (content item, destination) pair.
    pub async fn insert(&self, job: &DeliveryJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                id, content_item_id, destination_id, status, priority, retry_count,
                max_retries, last_error, skipped_reason, remote_id, published_url,
                created_at, scheduled_for, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.content_item_id.to_string())
        .bind(job.destination_id.to_string())
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(&job.last_error)
        .bind(&job.skipped_reason)
        .bind(&job.remote_id)
        .bind(&job.published_url)
        .bind(encode_time(job.created_at))
        .bind(encode_opt_time(job.scheduled_for))
        .bind(encode_opt_time(job.started_at))
        .bind(encode_opt_time(job.completed_at))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a job by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the row is malformed.
    pub async fn find(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let sql = format!("SELECT {COLUMNS} FROM delivery_jobs WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&*self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Applies a partial update to one job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub async fn update(&self, id: JobId, update: &JobUpdate) -> Result<()> {
        if *update == JobUpdate::default() {
            return match self.find(id).await? {
                Some(_) => Ok(()),
                None => Err(CoreError::NotFound(format!("job {id}"))),
            };
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE delivery_jobs SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(status) = update.status {
                fields.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(retry_count) = update.retry_count {
                fields.push("retry_count = ").push_bind_unseparated(i64::from(retry_count));
            }
            if let Some(last_error) = &update.last_error {
                fields.push("last_error = ").push_bind_unseparated(last_error.clone());
            }
            if let Some(reason) = &update.skipped_reason {
                fields.push("skipped_reason = ").push_bind_unseparated(reason.clone());
            }
            if let Some(remote_id) = &update.remote_id {
                fields.push("remote_id = ").push_bind_unseparated(remote_id.clone());
            }
            if let Some(url) = &update.published_url {
                fields.push("published_url = ").push_bind_unseparated(url.clone());
            }
            if let Some(scheduled_for) = update.scheduled_for {
                fields
                    .push("scheduled_for = ")
                    .push_bind_unseparated(encode_opt_time(scheduled_for));
            }
            if let Some(started_at) = update.started_at {
                fields.push("started_at = ").push_bind_unseparated(encode_opt_time(started_at));
            }
            if let Some(completed_at) = update.completed_at {
                fields.push("completed_at = ").push_bind_unseparated(encode_opt_time(completed_at));
            }
        }
        builder.push(" WHERE id = ").push_bind(id.to_string());

        let result = builder.build().execute(&*self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Atomically moves a pending job to processing.
    ///
    /// Returns `false` if the job was not pending (already claimed, cancelled
    /// or deleted).
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim(&self, id: JobId, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'processing', started_at = ?1
            WHERE id = ?2 AND status = 'pending'
            "#,
        )
        .bind(encode_time(started_at))
        .bind(id.to_string())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes a job that is not currently processing.
    ///
    /// Returns `false` if no such job exists.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` if the job is processing.
    pub async fn delete(&self, id: JobId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM delivery_jobs WHERE id = ?1 AND status != 'processing'")
                .bind(id.to_string())
                .execute(&*self.pool)
                .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.find(id).await? {
            Some(_) => Err(CoreError::ConstraintViolation(format!(
                "job {id} is processing and cannot be deleted"
            ))),
            None => Ok(false),
        }
    }

    /// Returns all jobs in `status`, in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(&self, status: JobStatus) -> Result<Vec<DeliveryJob>> {
        let sql = format!("SELECT {COLUMNS} FROM delivery_jobs WHERE status = ?1 {DISPATCH_ORDER}");
        let rows = sqlx::query(&sql).bind(status.as_str()).fetch_all(&*self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Returns up to `limit` pending jobs due at `now`, in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_jobs \
             WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1) \
             {DISPATCH_ORDER} LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(encode_time(now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Finds the pending or processing job for a (content item, destination)
    /// pair, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_for_pair(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> Result<Option<DeliveryJob>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_jobs \
             WHERE content_item_id = ?1 AND destination_id = ?2 \
               AND status IN ('pending', 'processing') \
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(content_item_id.to_string())
            .bind(destination_id.to_string())
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Finds the most recent job that delivered the item to the destination.
    ///
    /// Completions through a skip are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_delivered_for_pair(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> Result<Option<DeliveryJob>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_jobs \
             WHERE content_item_id = ?1 AND destination_id = ?2 \
               AND status = 'completed' AND skipped_reason IS NULL \
             ORDER BY completed_at DESC, rowid DESC \
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(content_item_id.to_string())
            .bind(destination_id.to_string())
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Returns processing jobs whose attempt started at or before
    /// `started_before`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<DeliveryJob>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_jobs \
             WHERE status = 'processing' AND (started_at IS NULL OR started_at <= ?1) \
             {DISPATCH_ORDER}"
        );
        let rows =
            sqlx::query(&sql).bind(encode_time(started_before)).fetch_all(&*self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Counts jobs per status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM delivery_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.add(status.parse()?, u64::try_from(total).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Deletes completed and cancelled jobs finished before `cutoff`.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE status IN ('completed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < ?1
            "#,
        )
        .bind(encode_time(cutoff))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<DeliveryJob> {
    let id: String = row.try_get("id")?;
    let content_item_id: String = row.try_get("content_item_id")?;
    let destination_id: String = row.try_get("destination_id")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let max_retries: i64 = row.try_get("max_retries")?;

    Ok(DeliveryJob {
        id: id.parse()?,
        content_item_id: content_item_id.parse()?,
        destination_id: destination_id.parse()?,
        status: status.parse()?,
        priority: Priority::from_rank(row.try_get("priority")?)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| CoreError::Serialization(format!("retry_count {retry_count}")))?,
        max_retries: u32::try_from(max_retries)
            .map_err(|_| CoreError::Serialization(format!("max_retries {max_retries}")))?,
        last_error: row.try_get("last_error")?,
        skipped_reason: row.try_get("skipped_reason")?,
        remote_id: row.try_get("remote_id")?,
        published_url: row.try_get("published_url")?,
        created_at: decode_time(row.try_get("created_at")?)?,
        scheduled_for: decode_opt_time(row.try_get("scheduled_for")?)?,
        started_at: decode_opt_time(row.try_get("started_at")?)?,
        completed_at: decode_opt_time(row.try_get("completed_at")?)?,
    })
}
