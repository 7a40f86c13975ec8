//! Uniform publishing contract over heterogeneous destination protocols.
//!
//! A [`Publisher`] delivers one content item to one destination. The
//! [`PublisherFactory`] chooses the implementation from the destination's
//! [`DestinationKind`], so the queue manager never knows which protocol it is
//! talking to.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ContentItem, Destination, DestinationKind};
use serde::{Deserialize, Serialize};

use crate::{
    client::HttpClient,
    error::{DeliveryError, Result},
};

pub mod activitypub;
pub mod auth;
pub mod drupal;
pub mod file;
pub mod local;
pub mod micropub;
pub mod webhook;
pub mod wordpress;

pub use activitypub::ActivityPubPublisher;
pub use drupal::DrupalPublisher;
pub use file::FilePublisher;
pub use local::LocalPublisher;
pub use micropub::MicropubPublisher;
pub use webhook::WebhookPublisher;
pub use wordpress::WordPressPublisher;

/// Where a successful delivery landed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Public URL of the published artifact.
    pub published_url: Option<String>,
    /// Identifier of the artifact on the remote side.
    pub remote_id: Option<String>,
}

/// Per-delivery inputs beyond the item itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishContext {
    /// Remote id of an earlier delivery to update in place.
    pub existing_remote_id: Option<String>,
}

/// Delivers content items to one destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `item`.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] whose retryability tells the queue whether
    /// another attempt may succeed.
    async fn publish(&self, item: &ContentItem, context: &PublishContext) -> Result<PublishOutcome>;

    /// Checks that the destination is reachable and accepts the credentials.
    async fn test_connection(&self) -> bool;

    /// Short protocol name for logs.
    fn protocol(&self) -> &'static str;
}

/// Builds the publisher for a destination.
pub trait PublisherFactory: Send + Sync + 'static {
    /// Returns the publisher for `destination`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when the destination cannot be served.
    fn publisher_for(&self, destination: &Destination) -> Result<Arc<dyn Publisher>>;
}

/// Maps every [`DestinationKind`] to its built-in publisher.
#[derive(Debug, Clone)]
pub struct DefaultPublisherFactory {
    client: HttpClient,
}

impl DefaultPublisherFactory {
    /// Creates a factory whose HTTP publishers share `client`.
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl PublisherFactory for DefaultPublisherFactory {
    fn publisher_for(&self, destination: &Destination) -> Result<Arc<dyn Publisher>> {
        let client = self.client.clone();
        let auth = destination.auth.clone();

        let publisher: Arc<dyn Publisher> = match &destination.kind {
            DestinationKind::WordPress { site_url, post_status } => {
                Arc::new(WordPressPublisher::new(client, site_url, post_status, auth)?)
            },
            DestinationKind::Drupal { site_url, bundle } => {
                Arc::new(DrupalPublisher::new(client, site_url, bundle, auth)?)
            },
            DestinationKind::Micropub { endpoint } => {
                Arc::new(MicropubPublisher::new(client, endpoint, auth)?)
            },
            DestinationKind::Webhook { .. } => {
                Arc::new(WebhookPublisher::from_kind(client, &destination.kind, auth)?)
            },
            DestinationKind::ActivityPub { inbox_url, actor_id } => {
                Arc::new(ActivityPubPublisher::new(client, inbox_url, actor_id, auth)?)
            },
            DestinationKind::Local => Arc::new(LocalPublisher),
            DestinationKind::File { directory } => {
                if directory.trim().is_empty() {
                    return Err(DeliveryError::configuration("file destination has no directory"));
                }
                Arc::new(FilePublisher::new(directory))
            },
        };

        Ok(publisher)
    }
}

/// Lowercase ASCII slug for file names and URLs.
pub(crate) fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.chars().take(60).collect::<String>().trim_end_matches('-').to_string()
    }
}
