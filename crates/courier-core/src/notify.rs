//! Fire-and-forget notifications about delivery outcomes.
//!
//! The queue manager calls [`Notifier::notify`] synchronously once a job
//! reaches a user-visible outcome and never waits on or inspects the result.
//! Implementations that need I/O must hand the notification off (for example
//! to a channel) instead of blocking the caller.
//!
//! ```text
//! ┌──────────────┐  Notification  ┌───────────────────┐
//! │ QueueManager │ ─────────────▶ │ MulticastNotifier │ ──▶ TracingNotifier
//! └──────────────┘                └───────────────────┘ ──▶ UI channel, ...
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{ContentItemId, DestinationId, JobId};

/// Outcome class of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Item delivered.
    Success,
    /// Item failed terminally.
    Failure,
}

/// A user-facing delivery notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Outcome class.
    pub kind: NotificationKind,
    /// Human-readable message.
    pub message: String,
    /// Job the notification is about.
    pub job_id: JobId,
    /// Delivered item.
    pub content_item_id: ContentItemId,
    /// Target destination.
    pub destination_id: DestinationId,
}

/// Receiver of delivery notifications.
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Delivers a notification. Must not block.
    fn notify(&self, notification: Notification);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpNotifier;

impl Notifier for NoOpNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Success => info!(
                job_id = %notification.job_id,
                destination_id = %notification.destination_id,
                "{}",
                notification.message
            ),
            NotificationKind::Failure => warn!(
                job_id = %notification.job_id,
                destination_id = %notification.destination_id,
                "{}",
                notification.message
            ),
        }
    }
}

/// Fans every notification out to several notifiers.
#[derive(Debug, Default)]
pub struct MulticastNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MulticastNotifier {
    /// Creates an empty multicast notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a receiver.
    pub fn add(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Number of receivers.
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Returns true if there are no receivers.
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl Notifier for MulticastNotifier {
    fn notify(&self, notification: Notification) {
        for notifier in &self.notifiers {
            notifier.notify(notification.clone());
        }
    }
}
