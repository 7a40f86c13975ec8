//! Duplicate-delivery detection and policy.
//!
//! A conflict exists when an earlier job already delivered the job's content
//! item to the job's destination, or when the item itself records a
//! publication there. The configured [`ConflictPolicy`] decides whether the
//! job completes without publishing, updates the existing artifact, or
//! creates a second one.

use std::{fmt, str::FromStr, sync::Arc};

use courier_core::{ContentItemId, DeliveryJob, DestinationId, JobId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{DeliveryError, QueueError},
    storage::{ContentStore, JobStore},
};

/// Reaction to an already-published item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Complete the job without publishing.
    #[default]
    Skip,
    /// Publish again, passing the existing remote id so the publisher can
    /// update in place.
    Overwrite,
    /// Publish a second artifact.
    #[serde(alias = "create_new")]
    CreateNew,
}

impl ConflictPolicy {
    /// Configuration string for this policy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
            Self::CreateNew => "create-new",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "create-new" => Ok(Self::CreateNew),
            other => Err(format!("unknown conflict policy {other:?}")),
        }
    }
}

/// Result of a conflict check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictCheck {
    /// True if the item is already published to the job's destination.
    pub has_conflict: bool,
    /// Remote id of the existing artifact.
    pub remote_id: Option<String>,
    /// Public URL of the existing artifact.
    pub published_url: Option<String>,
}

impl ConflictCheck {
    /// No earlier delivery.
    pub fn none() -> Self {
        Self::default()
    }
}

/// What the queue should do with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Complete the job without publishing.
    Skip {
        /// Annotation recorded on the job.
        reason: String,
    },
    /// Publish.
    Proceed {
        /// Remote id to update in place, for the overwrite policy.
        existing_remote_id: Option<String>,
    },
}

/// Applies a [`ConflictPolicy`] to delivery jobs.
#[derive(Clone)]
pub struct ConflictResolver {
    content: Arc<dyn ContentStore>,
    jobs: Arc<dyn JobStore>,
    policy: ConflictPolicy,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Creates a resolver over the given stores.
    pub fn new(
        content: Arc<dyn ContentStore>,
        jobs: Arc<dyn JobStore>,
        policy: ConflictPolicy,
    ) -> Self {
        Self { content, jobs, policy }
    }

    /// The configured policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Checks whether `job`'s item already reached its destination.
    ///
    /// Earlier delivered jobs for the pair are authoritative. The item's own
    /// linkage fields only record the latest destination, so they are
    /// consulted only when no such job is retained (for example after a
    /// purge).
    ///
    /// # Errors
    ///
    /// Returns a non-retryable `Validation` error if the item no longer
    /// exists, and `DatabaseError` on store failures.
    pub async fn check(&self, job: &DeliveryJob) -> Result<ConflictCheck, DeliveryError> {
        let item = self
            .content
            .find_content_item(job.content_item_id)
            .await?
            .ok_or_else(|| {
                DeliveryError::validation(format!("content item {} not found", job.content_item_id))
            })?;

        let earlier = self.jobs.find_delivered_job(job.content_item_id, job.destination_id).await?;
        let check = match earlier {
            Some(delivered) if delivered.id != job.id => {
                debug!(
                    job_id = %job.id,
                    earlier_job_id = %delivered.id,
                    remote_id = delivered.remote_id.as_deref().unwrap_or_default(),
                    "content already delivered to destination"
                );
                ConflictCheck {
                    has_conflict: true,
                    remote_id: delivered.remote_id,
                    published_url: delivered.published_url,
                }
            },
            _ if item.is_published_to(job.destination_id) => {
                debug!(
                    job_id = %job.id,
                    remote_id = item.remote_id.as_deref().unwrap_or_default(),
                    "content already published to destination"
                );
                ConflictCheck {
                    has_conflict: true,
                    remote_id: item.remote_id,
                    published_url: item.published_url,
                }
            },
            _ => ConflictCheck::none(),
        };

        Ok(check)
    }

    /// Decides how `job` proceeds given `check`.
    pub fn resolve(&self, job: &DeliveryJob, check: &ConflictCheck) -> Resolution {
        if !check.has_conflict {
            return Resolution::Proceed { existing_remote_id: None };
        }

        match self.policy {
            ConflictPolicy::Skip => {
                let mut reason = format!(
                    "already published to destination {} as {}",
                    job.destination_id,
                    check.remote_id.as_deref().unwrap_or("unknown")
                );
                if let Some(url) = &check.published_url {
                    reason.push_str(&format!(" ({url})"));
                }
                Resolution::Skip { reason }
            },
            ConflictPolicy::Overwrite => {
                Resolution::Proceed { existing_remote_id: check.remote_id.clone() }
            },
            ConflictPolicy::CreateNew => Resolution::Proceed { existing_remote_id: None },
        }
    }

    /// Returns the id of a pending or processing job for the pair, if any.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` on store failures.
    pub async fn is_duplicate_enqueue(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> Result<Option<JobId>, QueueError> {
        let active = self.jobs.find_active_job(content_item_id, destination_id).await?;
        Ok(active.map(|job| job.id))
    }
}
