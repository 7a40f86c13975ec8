//! Core domain models and shared abstractions for courier.
//!
//! Provides strongly-typed identifiers, the job/content/destination models,
//! the clock and notification seams, and SQLite persistence. The delivery
//! crate builds the scheduler on top of these types.
//!
//! # Architecture
//!
//! ```text
//! models ──▶ storage (sqlx / SQLite)
//!   │
//!   ├──▶ time (Clock, TestClock)
//!   └──▶ notify (Notifier sink)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod notify;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AuthConfig, ContentFormat, ContentItem, ContentItemId, ContentStatus, ContentUpdate,
    DeliveryJob, Destination, DestinationId, DestinationKind, DestinationStats, JobId, JobStatus,
    JobUpdate, Priority, StatusCounts,
};
pub use notify::{
    MulticastNotifier, NoOpNotifier, Notification, NotificationKind, Notifier, TracingNotifier,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
