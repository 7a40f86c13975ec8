//! Publisher that performs no I/O.

use async_trait::async_trait;
use courier_core::ContentItem;

use super::{PublishContext, PublishOutcome, Publisher};
use crate::error::Result;

/// Marks items delivered without sending them anywhere.
///
/// The remote id is derived from the item id so conflict detection works the
/// same as for remote destinations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPublisher;

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let remote_id =
            context.existing_remote_id.clone().unwrap_or_else(|| format!("local-{}", item.id));
        Ok(PublishOutcome { published_url: None, remote_id: Some(remote_id) })
    }

    async fn test_connection(&self) -> bool {
        true
    }

    fn protocol(&self) -> &'static str {
        "local"
    }
}
