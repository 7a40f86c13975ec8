//! Content delivery queue with retries, backoff and conflict handling.
//!
//! This crate implements the scheduler that takes captured content items and
//! delivers each to its configured destinations: blog APIs, webhooks,
//! federation inboxes or local files. Delivery survives process restarts,
//! never publishes the same item to the same destination twice under the
//! default policy, and backs off from slow or failing endpoints.
//!
//! # Architecture
//!
//! Every job moves through the same lifecycle:
//!
//! 1. **Admit** - `enqueue` validates the pair and stores a `pending` job
//! 2. **Claim** - the scheduler moves the best due job to `processing`
//! 3. **Resolve** - the conflict resolver skips, overwrites or republishes
//! 4. **Publish** - the destination's publisher delivers the item
//! 5. **Record** - success, a backed-off retry, or terminal failure
//!
//! The job store is the only source of truth. Orphaned `processing` jobs
//! left by a crash are recovered on the next start.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use courier_core::Storage;
//! use courier_delivery::{
//!     client::HttpClient, DefaultPublisherFactory, QueueManager, SqliteDeliveryStorage,
//! };
//!
//! # async fn example(storage: Storage) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteDeliveryStorage::new(Arc::new(storage)));
//! let factory = Arc::new(DefaultPublisherFactory::new(HttpClient::with_defaults()?));
//!
//! let queue = QueueManager::with_storage(store, factory).build();
//! queue.start().await?;
//!
//! let status = queue.status().await?;
//! println!("{:.0}% delivered", status.progress);
//!
//! queue.shutdown(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod client;
pub mod conflict;
pub mod error;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod storage;

pub use conflict::{ConflictCheck, ConflictPolicy, ConflictResolver, Resolution};
pub use error::{DeliveryError, ErrorCategory, QueueError, Result};
pub use publisher::{
    DefaultPublisherFactory, PublishContext, PublishOutcome, Publisher, PublisherFactory,
};
pub use queue::{QueueConfig, QueueManager, QueueManagerBuilder, QueueStatus};
pub use retry::{RetryDecision, RetryPolicy, RetryStrategy};
pub use storage::{
    memory::InMemoryStorage, ContentStore, DestinationStore, JobStore, SqliteDeliveryStorage,
};

/// Default number of jobs processing at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default interval of the scheduler tick.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default age after which an unowned `processing` job counts as interrupted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);
