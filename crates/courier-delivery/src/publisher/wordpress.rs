//! REST CMS publisher for the WordPress posts API.

use async_trait::async_trait;
use courier_core::{AuthConfig, ContentItem};
use reqwest::Method;
use serde_json::{json, Value};

use super::{auth::authorize, PublishContext, PublishOutcome, Publisher};
use crate::{
    client::{join_url, parse_url, HttpClient},
    error::{DeliveryError, Result},
};

const PROTOCOL: &str = "wordpress";

/// Creates or updates posts through `/wp-json/wp/v2/posts`.
#[derive(Debug, Clone)]
pub struct WordPressPublisher {
    client: HttpClient,
    site_url: String,
    post_status: String,
    auth: AuthConfig,
}

impl WordPressPublisher {
    /// Creates a publisher for the site at `site_url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `site_url` is not an http(s) URL.
    pub fn new(
        client: HttpClient,
        site_url: &str,
        post_status: &str,
        auth: AuthConfig,
    ) -> Result<Self> {
        parse_url(site_url)?;
        Ok(Self {
            client,
            site_url: site_url.trim_end_matches('/').to_string(),
            post_status: post_status.to_string(),
            auth,
        })
    }

    fn posts_url(&self, existing: Option<&str>) -> String {
        match existing {
            Some(id) => join_url(&self.site_url, &format!("wp-json/wp/v2/posts/{id}")),
            None => join_url(&self.site_url, "wp-json/wp/v2/posts"),
        }
    }

    fn payload(&self, item: &ContentItem) -> Value {
        let mut content = item.body.clone();
        if let Some(source) = &item.source_url {
            content.push_str(&format!("\n\n<p><a href=\"{source}\">Source</a></p>"));
        }

        json!({
            "title": item.title,
            "content": content,
            "status": self.post_status,
            "format": "standard",
        })
    }
}

#[async_trait]
impl Publisher for WordPressPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let url = self.posts_url(context.existing_remote_id.as_deref());
        let request = self.client.request(Method::POST, &url)?.json(&self.payload(item));
        let request = authorize(request, &self.auth)?;

        let body = self.client.send(request, PROTOCOL).await?.json()?;

        let remote_id = match &body["id"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return Err(DeliveryError::invalid_response("post response has no id")),
        };
        let published_url = body["link"].as_str().map(str::to_string);

        Ok(PublishOutcome { published_url, remote_id: Some(remote_id) })
    }

    async fn test_connection(&self) -> bool {
        let url = join_url(&self.site_url, "wp-json/wp/v2/users/me");
        let Ok(request) = self.client.request(Method::GET, &url) else {
            return false;
        };
        let Ok(request) = authorize(request, &self.auth) else {
            return false;
        };
        self.client.reachable(request, PROTOCOL).await
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }
}
