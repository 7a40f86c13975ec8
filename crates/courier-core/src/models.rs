//! Core domain models and strongly-typed identifiers.
//!
//! Defines content items, delivery jobs, destinations and the partial-update
//! types the stores accept. Identifiers are UUID newtypes so a job id can
//! never be passed where a destination id is expected.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::Serialization(format!("invalid {}: {e}", stringify!($name))))
            }
        }
    };
}

define_id!(
    /// Strongly-typed delivery job identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_core::models::JobId;
    /// let job_id = JobId::new();
    /// println!("dispatching job {}", job_id);
    /// ```
    JobId
);

define_id!(
    /// Strongly-typed content item identifier.
    ContentItemId
);

define_id!(
    /// Strongly-typed destination identifier.
    DestinationId
);

/// Lifecycle state of a delivery job.
///
/// `pending → processing → completed`, `processing → pending` on retry,
/// `processing → failed` once the retry budget is spent and
/// `pending → cancelled` on user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dispatch, possibly until `scheduled_for`.
    Pending,
    /// Claimed by the scheduler and executing.
    Processing,
    /// Delivered, or skipped because the item was already delivered.
    Completed,
    /// Retry budget exhausted or non-retryable error.
    Failed,
    /// Cancelled before dispatch.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] =
        [Self::Pending, Self::Processing, Self::Completed, Self::Failed, Self::Cancelled];

    /// Returns true for states a job never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while a job still occupies its (item, destination) pair.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

/// Dispatch priority. Used only as a sort key; running jobs are never
/// preempted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background deliveries.
    Low = 0,
    /// Default priority.
    #[default]
    Normal = 1,
    /// Ahead of normal traffic.
    High = 2,
    /// Dispatched before everything else.
    Urgent = 3,
}

impl Priority {
    /// Numeric rank stored in the database; higher dispatches first.
    pub fn rank(self) -> i64 {
        self as i64
    }

    /// Maps a stored rank back to a priority.
    pub fn from_rank(rank: i64) -> Result<Self, CoreError> {
        match rank {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(CoreError::Serialization(format!("unknown priority rank: {other}"))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Publish state of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    /// Captured, not yet delivered (or reset for manual retry).
    #[default]
    Pending,
    /// Delivered; remote linkage fields are set.
    Published,
    /// Last delivery attempt failed terminally.
    Failed,
}

impl ContentStatus {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Serialization(format!("unknown content status: {other}"))),
        }
    }
}

/// Body format of a captured item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    /// Plain text.
    Text,
    /// HTML fragment.
    Html,
    /// Markdown source.
    #[default]
    Markdown,
}

impl ContentFormat {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Html => "html",
            Self::Markdown => "markdown",
        }
    }
}

impl FromStr for ContentFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "html" => Ok(Self::Html),
            "markdown" => Ok(Self::Markdown),
            other => Err(CoreError::Serialization(format!("unknown content format: {other}"))),
        }
    }
}

/// A captured unit of content to deliver.
///
/// Captured fields are immutable once created. The queue engine only writes
/// the publish outcome fields through [`ContentUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Unique identifier.
    pub id: ContentItemId,
    /// Title or headline.
    pub title: String,
    /// Body in `format`.
    pub body: String,
    /// Format of `body`.
    pub format: ContentFormat,
    /// Author display name.
    pub author: Option<String>,
    /// Page the content was captured from.
    pub source_url: Option<String>,
    /// Platform tag of the source (e.g. "twitter").
    pub platform: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Cached media references.
    pub media_urls: Vec<String>,
    /// Extraction metadata.
    pub metadata: serde_json::Value,
    /// Publish state.
    pub status: ContentStatus,
    /// Public URL of the delivered artifact.
    pub published_url: Option<String>,
    /// Identifier of the artifact on the remote system.
    pub remote_id: Option<String>,
    /// Destination the item was delivered to.
    pub destination_id: Option<DestinationId>,
    /// Last terminal delivery error.
    pub error: Option<String>,
    /// When the item was captured.
    pub created_at: DateTime<Utc>,
    /// When the item was last published.
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    /// Creates a pending markdown item with the given title and body.
    pub fn new(title: impl Into<String>, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ContentItemId::new(),
            title: title.into(),
            body: body.into(),
            format: ContentFormat::default(),
            author: None,
            source_url: None,
            platform: None,
            tags: Vec::new(),
            media_urls: Vec::new(),
            metadata: serde_json::Value::Null,
            status: ContentStatus::Pending,
            published_url: None,
            remote_id: None,
            destination_id: None,
            error: None,
            created_at: now,
            published_at: None,
        }
    }

    /// Returns true if this item is already published to `destination`
    /// with a known remote id.
    pub fn is_published_to(&self, destination: DestinationId) -> bool {
        self.status == ContentStatus::Published
            && self.destination_id == Some(destination)
            && self.remote_id.is_some()
    }
}

/// Partial update of a content item's outcome fields.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentUpdate {
    /// New publish state.
    pub status: Option<ContentStatus>,
    /// Public URL.
    pub published_url: Option<Option<String>>,
    /// Remote identifier.
    pub remote_id: Option<Option<String>>,
    /// Destination linkage.
    pub destination_id: Option<Option<DestinationId>>,
    /// Error message.
    pub error: Option<Option<String>>,
    /// Publish timestamp.
    pub published_at: Option<Option<DateTime<Utc>>>,
}

impl ContentUpdate {
    /// Outcome of a successful delivery.
    pub fn published(
        destination: DestinationId,
        published_url: Option<String>,
        remote_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(ContentStatus::Published),
            published_url: Some(published_url),
            remote_id: Some(remote_id),
            destination_id: Some(Some(destination)),
            error: Some(None),
            published_at: Some(Some(at)),
        }
    }

    /// Outcome of a terminal delivery failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(ContentStatus::Failed),
            error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    /// Reset for a manual retry.
    pub fn reset() -> Self {
        Self { status: Some(ContentStatus::Pending), error: Some(None), ..Self::default() }
    }

    /// Applies the update in place.
    pub fn apply(&self, item: &mut ContentItem) {
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(url) = &self.published_url {
            item.published_url.clone_from(url);
        }
        if let Some(remote_id) = &self.remote_id {
            item.remote_id.clone_from(remote_id);
        }
        if let Some(destination_id) = self.destination_id {
            item.destination_id = destination_id;
        }
        if let Some(error) = &self.error {
            item.error.clone_from(error);
        }
        if let Some(published_at) = self.published_at {
            item.published_at = published_at;
        }
    }
}

/// One attempt-tracking unit linking a content item to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Unique identifier.
    pub id: JobId,
    /// Item to deliver.
    pub content_item_id: ContentItemId,
    /// Target destination.
    pub destination_id: DestinationId,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Dispatch priority.
    pub priority: Priority,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget after the first attempt.
    pub max_retries: u32,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Set when the conflict resolver skipped delivery.
    pub skipped_reason: Option<String>,
    /// Remote identifier returned by a successful publish.
    pub remote_id: Option<String>,
    /// Public URL returned by a successful publish.
    pub published_url: Option<String>,
    /// Admission time; tie-break for equal priority.
    pub created_at: DateTime<Utc>,
    /// Earliest dispatch time for a backed-off retry.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// When the current or last attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryJob {
    /// Creates a pending job.
    pub fn new(
        content_item_id: ContentItemId,
        destination_id: DestinationId,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            content_item_id,
            destination_id,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            last_error: None,
            skipped_reason: None,
            remote_id: None,
            published_url: None,
            created_at: now,
            scheduled_for: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true if the job may be dispatched at `now`.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for.map_or(true, |at| at <= now)
    }

    /// Returns true if this job delivered its item, as opposed to completing
    /// through a skip.
    pub fn is_delivered(&self) -> bool {
        self.status == JobStatus::Completed && self.skipped_reason.is_none()
    }

    /// Dispatch order: higher priority first, then oldest first.
    pub fn dispatch_order(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

/// Partial update of a delivery job.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// New status.
    pub status: Option<JobStatus>,
    /// New retry count.
    pub retry_count: Option<u32>,
    /// Last error message.
    pub last_error: Option<Option<String>>,
    /// Skip annotation.
    pub skipped_reason: Option<Option<String>>,
    /// Remote identifier of the delivered artifact.
    pub remote_id: Option<Option<String>>,
    /// Public URL of the delivered artifact.
    pub published_url: Option<Option<String>>,
    /// Earliest dispatch time.
    pub scheduled_for: Option<Option<DateTime<Utc>>>,
    /// Attempt start time.
    pub started_at: Option<Option<DateTime<Utc>>>,
    /// Terminal time.
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    /// Successful completion.
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            last_error: Some(None),
            scheduled_for: Some(None),
            completed_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Successful delivery with the remote linkage the publisher returned.
    pub fn published(
        remote_id: Option<String>,
        published_url: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            remote_id: Some(remote_id),
            published_url: Some(published_url),
            ..Self::completed(at)
        }
    }

    /// Completion without delivery because the item was already published.
    pub fn skipped(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { skipped_reason: Some(Some(reason.into())), ..Self::completed(at) }
    }

    /// Terminal failure.
    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            last_error: Some(Some(error.into())),
            scheduled_for: Some(None),
            completed_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Back to the pending pool after a failed attempt.
    pub fn retry_at(retry_count: u32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            retry_count: Some(retry_count),
            last_error: Some(Some(error.into())),
            scheduled_for: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Manual retry reset.
    pub fn reset() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            retry_count: Some(0),
            last_error: Some(None),
            skipped_reason: Some(None),
            remote_id: Some(None),
            published_url: Some(None),
            scheduled_for: Some(None),
            started_at: Some(None),
            completed_at: Some(None),
        }
    }

    /// User cancellation.
    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            scheduled_for: Some(None),
            completed_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Applies the update in place.
    pub fn apply(&self, job: &mut DeliveryJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(last_error) = &self.last_error {
            job.last_error.clone_from(last_error);
        }
        if let Some(reason) = &self.skipped_reason {
            job.skipped_reason.clone_from(reason);
        }
        if let Some(remote_id) = &self.remote_id {
            job.remote_id.clone_from(remote_id);
        }
        if let Some(url) = &self.published_url {
            job.published_url.clone_from(url);
        }
        if let Some(scheduled_for) = self.scheduled_for {
            job.scheduled_for = scheduled_for;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = completed_at;
        }
    }
}

/// Credentials attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication headers.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// Access token.
        token: String,
    },
    /// `Authorization: Basic <base64(username:password)>`.
    Basic {
        /// User name.
        username: String,
        /// Password or application password.
        password: String,
    },
    /// Key sent in a named header.
    ApiKey {
        /// Header name, e.g. `X-Api-Key`.
        header: String,
        /// Key value.
        key: String,
    },
    /// Arbitrary headers.
    Custom {
        /// Header name to value.
        headers: BTreeMap<String, String>,
    },
}

/// Protocol family of a destination plus its protocol-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationKind {
    /// REST-based CMS exposing `/wp-json/wp/v2/posts`.
    WordPress {
        /// Site root, e.g. `https://blog.example.com`.
        site_url: String,
        /// Post status to create (`publish`, `draft`).
        #[serde(default = "default_post_status")]
        post_status: String,
    },
    /// JSON:API CMS exposing `/jsonapi/node/{bundle}`.
    Drupal {
        /// Site root.
        site_url: String,
        /// Content type bundle, e.g. `article`.
        #[serde(default = "default_node_bundle")]
        bundle: String,
    },
    /// Form-encoded posting endpoint.
    Micropub {
        /// Endpoint URL.
        endpoint: String,
    },
    /// Generic webhook with a templated payload.
    Webhook {
        /// Target URL.
        url: String,
        /// HTTP method, `POST` by default.
        #[serde(default = "default_webhook_method")]
        method: String,
        /// JSON template with `{{field}}` placeholders. `None` sends the item.
        #[serde(default)]
        payload_template: Option<String>,
        /// Dotted path to the published URL in the response body.
        #[serde(default)]
        url_path: Option<String>,
        /// Dotted path to the remote id in the response body.
        #[serde(default)]
        id_path: Option<String>,
        /// Extra static headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Federation push to an actor's inbox.
    ActivityPub {
        /// Inbox URL receiving activities.
        inbox_url: String,
        /// Actor id the activity is attributed to.
        actor_id: String,
    },
    /// Records the item as delivered without any I/O.
    Local,
    /// Writes the item to a file in a directory.
    File {
        /// Output directory.
        directory: String,
    },
}

fn default_post_status() -> String {
    "publish".to_string()
}

fn default_node_bundle() -> String {
    "article".to_string()
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl DestinationKind {
    /// Short protocol name for logs.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::WordPress { .. } => "wordpress",
            Self::Drupal { .. } => "drupal",
            Self::Micropub { .. } => "micropub",
            Self::Webhook { .. } => "webhook",
            Self::ActivityPub { .. } => "activitypub",
            Self::Local => "local",
            Self::File { .. } => "file",
        }
    }
}

/// Delivery counters for a destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStats {
    /// Successful deliveries.
    pub total_published: u64,
    /// Terminal failures.
    pub failed_count: u64,
}

/// A configured remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Unique identifier.
    pub id: DestinationId,
    /// Display name.
    pub name: String,
    /// Protocol and its settings.
    pub kind: DestinationKind,
    /// Credentials.
    pub auth: AuthConfig,
    /// Disabled destinations reject deliveries.
    pub enabled: bool,
    /// Default destinations receive `enqueue_default` items.
    pub is_default: bool,
    /// Delivery counters.
    pub stats: DestinationStats,
    /// Last successful delivery.
    pub last_sync: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Destination {
    /// Creates an enabled, non-default destination without credentials.
    pub fn new(name: impl Into<String>, kind: DestinationKind, now: DateTime<Utc>) -> Self {
        Self {
            id: DestinationId::new(),
            name: name.into(),
            kind,
            auth: AuthConfig::None,
            enabled: true,
            is_default: false,
            stats: DestinationStats::default(),
            last_sync: None,
            created_at: now,
        }
    }
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Pending jobs.
    pub pending: u64,
    /// Processing jobs.
    pub processing: u64,
    /// Completed jobs.
    pub completed: u64,
    /// Failed jobs.
    pub failed: u64,
    /// Cancelled jobs.
    pub cancelled: u64,
}

impl StatusCounts {
    /// Adds `count` to the bucket for `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Returns the count for `status`.
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Total jobs across all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn job_at(priority: Priority, created_at: DateTime<Utc>) -> DeliveryJob {
        DeliveryJob::new(ContentItemId::new(), DestinationId::new(), priority, 3, created_at)
    }

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(Priority::from_rank(Priority::Urgent.rank()).unwrap(), Priority::Urgent);
        assert!(Priority::from_rank(7).is_err());
    }

    #[test]
    fn dispatch_order_prefers_priority_then_age() {
        let now = Utc::now();
        let old_normal = job_at(Priority::Normal, now - Duration::seconds(10));
        let new_normal = job_at(Priority::Normal, now);
        let new_urgent = job_at(Priority::Urgent, now);

        let mut jobs = vec![new_normal.clone(), old_normal.clone(), new_urgent.clone()];
        jobs.sort_by(DeliveryJob::dispatch_order);

        assert_eq!(jobs[0].id, new_urgent.id);
        assert_eq!(jobs[1].id, old_normal.id);
        assert_eq!(jobs[2].id, new_normal.id);
    }

    #[test]
    fn scheduled_jobs_wait_until_due() {
        let now = Utc::now();
        let mut job = job_at(Priority::Normal, now);
        assert!(job.is_dispatchable(now));

        job.scheduled_for = Some(now + Duration::seconds(30));
        assert!(!job.is_dispatchable(now));
        assert!(job.is_dispatchable(now + Duration::seconds(30)));

        job.status = JobStatus::Processing;
        assert!(!job.is_dispatchable(now + Duration::seconds(60)));
    }

    #[test]
    fn job_update_distinguishes_clear_from_untouched() {
        let now = Utc::now();
        let mut job = job_at(Priority::Normal, now);
        job.last_error = Some("boom".to_string());

        JobUpdate { retry_count: Some(2), ..JobUpdate::default() }.apply(&mut job);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.retry_count, 2);

        JobUpdate::reset().apply(&mut job);
        assert_eq!(job.last_error, None);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn published_job_keeps_remote_linkage() {
        let now = Utc::now();
        let mut job = job_at(Priority::Normal, now);

        JobUpdate::published(Some("42".into()), Some("https://example.com/42".into()), now)
            .apply(&mut job);
        assert!(job.is_delivered());
        assert_eq!(job.remote_id.as_deref(), Some("42"));

        let mut skipped = job_at(Priority::Normal, now);
        JobUpdate::skipped("already there", now).apply(&mut skipped);
        assert_eq!(skipped.status, JobStatus::Completed);
        assert!(!skipped.is_delivered());
    }

    #[test]
    fn published_update_links_destination() {
        let now = Utc::now();
        let destination = DestinationId::new();
        let mut item = ContentItem::new("title", "body", now);
        item.error = Some("earlier failure".to_string());

        ContentUpdate::published(
            destination,
            Some("https://blog.example.com/p/42".to_string()),
            Some("42".to_string()),
            now,
        )
        .apply(&mut item);

        assert!(item.is_published_to(destination));
        assert!(!item.is_published_to(DestinationId::new()));
        assert_eq!(item.error, None);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("delivering".parse::<JobStatus>().is_err());
    }

    #[test]
    fn destination_kind_deserializes_with_defaults() {
        let kind: DestinationKind = serde_json::from_value(serde_json::json!({
            "type": "webhook",
            "url": "https://hooks.example.com/in",
        }))
        .unwrap();

        match kind {
            DestinationKind::Webhook { method, payload_template, headers, .. } => {
                assert_eq!(method, "POST");
                assert!(payload_template.is_none());
                assert!(headers.is_empty());
            },
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn status_counts_total() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Pending, 2);
        counts.add(JobStatus::Completed, 3);
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.get(JobStatus::Completed), 3);
    }
}
