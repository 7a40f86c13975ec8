//! Publisher writing Markdown files with front matter.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use courier_core::ContentItem;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::debug;

use super::{slugify, PublishContext, PublishOutcome, Publisher};
use crate::error::{DeliveryError, Result};

/// Upper bound on numbered copies of one item in a directory.
const MAX_COPIES: u32 = 1000;

/// Writes one `.md` file per item into a directory.
///
/// The remote id is the file name; overwriting rewrites that file. A fresh
/// delivery never replaces an existing file: repeated deliveries of the same
/// item get numbered names (`slug-1a2b3c4d-2.md`).
#[derive(Debug, Clone)]
pub struct FilePublisher {
    directory: PathBuf,
}

impl FilePublisher {
    /// Creates a publisher writing into `directory`, created on demand.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self { directory: directory.as_ref().to_path_buf() }
    }

    /// File name used for a fresh delivery of `item`.
    pub fn file_name(item: &ContentItem) -> String {
        let id = item.id.to_string();
        format!("{}-{}.md", slugify(&item.title), &id[..8])
    }

    fn numbered_file_name(item: &ContentItem, copy: u32) -> String {
        let id = item.id.to_string();
        format!("{}-{}-{copy}.md", slugify(&item.title), &id[..8])
    }

    fn existing_file_name(remote_id: &str) -> Result<&str> {
        let valid = !remote_id.is_empty()
            && Path::new(remote_id).file_name().and_then(|n| n.to_str()) == Some(remote_id);
        if valid {
            Ok(remote_id)
        } else {
            Err(DeliveryError::validation(format!("invalid file remote id {remote_id:?}")))
        }
    }

    /// Creates a new file for `item`, numbering the name past existing ones.
    async fn write_fresh(&self, item: &ContentItem, document: &str) -> Result<(String, PathBuf)> {
        for copy in 1..=MAX_COPIES {
            let file_name = match copy {
                1 => Self::file_name(item),
                n => Self::numbered_file_name(item, n),
            };
            let path = self.directory.join(&file_name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(DeliveryError::io(format!(
                        "failed to create {}: {e}",
                        path.display()
                    )))
                },
            };
            file.write_all(document.as_bytes()).await.map_err(|e| {
                DeliveryError::io(format!("failed to write {}: {e}", path.display()))
            })?;
            file.flush().await.map_err(|e| {
                DeliveryError::io(format!("failed to write {}: {e}", path.display()))
            })?;
            return Ok((file_name, path));
        }

        Err(DeliveryError::io(format!(
            "no free file name for {} in {}",
            Self::file_name(item),
            self.directory.display()
        )))
    }
}

/// Renders `item` as Markdown with YAML front matter.
pub fn render_markdown(item: &ContentItem) -> String {
    let mut doc = String::from("---\n");
    doc.push_str(&format!("title: {}\n", yaml_string(&item.title)));
    doc.push_str(&format!("date: {}\n", item.created_at.to_rfc3339()));
    if let Some(author) = &item.author {
        doc.push_str(&format!("author: {}\n", yaml_string(author)));
    }
    if let Some(source) = &item.source_url {
        doc.push_str(&format!("source: {}\n", yaml_string(source)));
    }
    if let Some(platform) = &item.platform {
        doc.push_str(&format!("platform: {}\n", yaml_string(platform)));
    }
    if !item.tags.is_empty() {
        doc.push_str("tags:\n");
        for tag in &item.tags {
            doc.push_str(&format!("  - {}\n", yaml_string(tag)));
        }
    }
    doc.push_str("---\n\n");
    doc.push_str(&item.body);
    if !item.body.ends_with('\n') {
        doc.push('\n');
    }
    doc
}

// JSON strings are valid YAML double-quoted scalars.
fn yaml_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let existing =
            context.existing_remote_id.as_deref().map(Self::existing_file_name).transpose()?;

        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| {
            DeliveryError::io(format!("failed to create {}: {e}", self.directory.display()))
        })?;

        let document = render_markdown(item);
        let (file_name, path) = match existing {
            Some(existing) => {
                let file_name = existing.to_string();
                let path = self.directory.join(&file_name);
                tokio::fs::write(&path, &document).await.map_err(|e| {
                    DeliveryError::io(format!("failed to write {}: {e}", path.display()))
                })?;
                (file_name, path)
            },
            None => self.write_fresh(item, &document).await?,
        };

        debug!(path = %path.display(), "wrote content file");

        Ok(PublishOutcome {
            published_url: Some(format!("file://{}", path.display())),
            remote_id: Some(file_name),
        })
    }

    async fn test_connection(&self) -> bool {
        if tokio::fs::create_dir_all(&self.directory).await.is_err() {
            return false;
        }
        let marker = self.directory.join(".courier-write-check");
        let writable = tokio::fs::write(&marker, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&marker).await;
        writable
    }

    fn protocol(&self) -> &'static str {
        "file"
    }
}
