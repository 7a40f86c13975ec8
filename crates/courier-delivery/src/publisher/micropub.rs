//! Form-encoded RPC publisher for Micropub endpoints.

use async_trait::async_trait;
use courier_core::{AuthConfig, ContentItem};
use reqwest::Method;

use super::{auth::authorize, PublishContext, PublishOutcome, Publisher};
use crate::{
    client::{parse_url, HttpClient},
    error::{DeliveryError, Result},
};

const PROTOCOL: &str = "micropub";

/// Posts `h=entry` forms; the created post's URL comes back in `Location`.
#[derive(Debug, Clone)]
pub struct MicropubPublisher {
    client: HttpClient,
    endpoint: String,
    auth: AuthConfig,
}

impl MicropubPublisher {
    /// Creates a publisher for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `endpoint` is not an http(s) URL.
    pub fn new(client: HttpClient, endpoint: &str, auth: AuthConfig) -> Result<Self> {
        parse_url(endpoint)?;
        Ok(Self { client, endpoint: endpoint.to_string(), auth })
    }

    fn form(item: &ContentItem, existing: Option<&str>) -> Vec<(&'static str, String)> {
        if let Some(url) = existing {
            return vec![
                ("action", "update".to_string()),
                ("url", url.to_string()),
                ("replace[name]", item.title.clone()),
                ("replace[content]", item.body.clone()),
            ];
        }

        let mut form = vec![
            ("h", "entry".to_string()),
            ("name", item.title.clone()),
            ("content", item.body.clone()),
        ];
        if let Some(source) = &item.source_url {
            form.push(("bookmark-of", source.clone()));
        }
        for tag in &item.tags {
            form.push(("category[]", tag.clone()));
        }
        for media in &item.media_urls {
            form.push(("photo[]", media.clone()));
        }
        form
    }
}

#[async_trait]
impl Publisher for MicropubPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let existing = context.existing_remote_id.as_deref();
        let request = self
            .client
            .request(Method::POST, &self.endpoint)?
            .form(&Self::form(item, existing));
        let request = authorize(request, &self.auth)?;

        let response = self.client.send(request, PROTOCOL).await?;

        let location = response.header("location").map(str::to_string);
        let location = match (location, existing) {
            (Some(location), _) => location,
            (None, Some(url)) => url.to_string(),
            (None, None) => {
                return Err(DeliveryError::invalid_response(
                    "micropub response has no Location header",
                ))
            },
        };

        Ok(PublishOutcome { published_url: Some(location.clone()), remote_id: Some(location) })
    }

    async fn test_connection(&self) -> bool {
        let Ok(request) = self.client.request(Method::GET, &self.endpoint) else {
            return false;
        };
        let Ok(request) = authorize(request.query(&[("q", "config")]), &self.auth) else {
            return false;
        };
        self.client.reachable(request, PROTOCOL).await
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }
}
