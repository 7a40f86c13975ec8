//! Repository for captured content items.

use std::sync::Arc;

use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};

use super::{decode_opt_id, decode_opt_time, decode_time, encode_opt_time, encode_time};
use crate::{
    error::{CoreError, Result},
    models::{ContentItem, ContentItemId, ContentUpdate},
};

const COLUMNS: &str = "id, title, body, format, author, source_url, platform, tags, media_urls, \
                       metadata, status, published_url, remote_id, destination_id, error, \
                       created_at, published_at";

/// Repository for content item database operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Inserts a captured item.
    ///
    /// # Errors
    ///
    /// Returns error if the id already exists or the insert fails.
    pub async fn insert(&self, item: &ContentItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_items (
                id, title, body, format, author, source_url, platform, tags, media_urls,
                metadata, status, published_url, remote_id, destination_id, error,
                created_at, published_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.title)
        .bind(&item.body)
        .bind(item.format.as_str())
        .bind(&item.author)
        .bind(&item.source_url)
        .bind(&item.platform)
        .bind(serde_json::to_string(&item.tags)?)
        .bind(serde_json::to_string(&item.media_urls)?)
        .bind(serde_json::to_string(&item.metadata)?)
        .bind(item.status.as_str())
        .bind(&item.published_url)
        .bind(&item.remote_id)
        .bind(item.destination_id.map(|id| id.to_string()))
        .bind(&item.error)
        .bind(encode_time(item.created_at))
        .bind(encode_opt_time(item.published_at))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds an item by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the row is malformed.
    pub async fn find(&self, id: ContentItemId) -> Result<Option<ContentItem>> {
        let sql = format!("SELECT {COLUMNS} FROM content_items WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id.to_string()).fetch_optional(&*self.pool).await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Writes publish outcome fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub async fn update(&self, id: ContentItemId, update: &ContentUpdate) -> Result<()> {
        if *update == ContentUpdate::default() {
            return match self.find(id).await? {
                Some(_) => Ok(()),
                None => Err(CoreError::NotFound(format!("content item {id}"))),
            };
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE content_items SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(status) = update.status {
                fields.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(url) = &update.published_url {
                fields.push("published_url = ").push_bind_unseparated(url.clone());
            }
            if let Some(remote_id) = &update.remote_id {
                fields.push("remote_id = ").push_bind_unseparated(remote_id.clone());
            }
            if let Some(destination_id) = update.destination_id {
                fields
                    .push("destination_id = ")
                    .push_bind_unseparated(destination_id.map(|id| id.to_string()));
            }
            if let Some(error) = &update.error {
                fields.push("error = ").push_bind_unseparated(error.clone());
            }
            if let Some(published_at) = update.published_at {
                fields.push("published_at = ").push_bind_unseparated(encode_opt_time(published_at));
            }
        }
        builder.push(" WHERE id = ").push_bind(id.to_string());

        let result = builder.build().execute(&*self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("content item {id}")));
        }
        Ok(())
    }
}

fn item_from_row(row: &SqliteRow) -> Result<ContentItem> {
    let id: String = row.try_get("id")?;
    let format: String = row.try_get("format")?;
    let status: String = row.try_get("status")?;
    let tags: String = row.try_get("tags")?;
    let media_urls: String = row.try_get("media_urls")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(ContentItem {
        id: id.parse()?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        format: format.parse()?,
        author: row.try_get("author")?,
        source_url: row.try_get("source_url")?,
        platform: row.try_get("platform")?,
        tags: serde_json::from_str(&tags)?,
        media_urls: serde_json::from_str(&media_urls)?,
        metadata: serde_json::from_str(&metadata)?,
        status: status.parse()?,
        published_url: row.try_get("published_url")?,
        remote_id: row.try_get("remote_id")?,
        destination_id: decode_opt_id(row.try_get("destination_id")?)?,
        error: row.try_get("error")?,
        created_at: decode_time(row.try_get("created_at")?)?,
        published_at: decode_opt_time(row.try_get("published_at")?)?,
    })
}
