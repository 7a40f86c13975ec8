//! Notifier that keeps every notification for assertions.

use std::sync::{Mutex, PoisonError};

use courier_core::{Notification, NotificationKind, Notifier};

/// Records notifications in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Received notifications of `kind`.
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications().into_iter().filter(|n| n.kind == kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push(notification);
    }
}
