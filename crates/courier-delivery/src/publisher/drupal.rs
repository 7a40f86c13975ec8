//! JSON:API CMS publisher for Drupal-style `/jsonapi/node/{bundle}`.

use async_trait::async_trait;
use courier_core::{AuthConfig, ContentFormat, ContentItem};
use reqwest::{header::CONTENT_TYPE, Method};
use serde_json::{json, Value};

use super::{auth::authorize, PublishContext, PublishOutcome, Publisher};
use crate::{
    client::{join_url, parse_url, HttpClient},
    error::{DeliveryError, Result},
};

const PROTOCOL: &str = "drupal";
const JSON_API: &str = "application/vnd.api+json";

/// Creates nodes, or patches an existing node when overwriting.
#[derive(Debug, Clone)]
pub struct DrupalPublisher {
    client: HttpClient,
    site_url: String,
    bundle: String,
    auth: AuthConfig,
}

impl DrupalPublisher {
    /// Creates a publisher for nodes of `bundle` on `site_url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for a malformed URL or empty bundle.
    pub fn new(client: HttpClient, site_url: &str, bundle: &str, auth: AuthConfig) -> Result<Self> {
        parse_url(site_url)?;
        if bundle.trim().is_empty() {
            return Err(DeliveryError::configuration("node bundle must not be empty"));
        }
        Ok(Self {
            client,
            site_url: site_url.trim_end_matches('/').to_string(),
            bundle: bundle.to_string(),
            auth,
        })
    }

    fn document(&self, item: &ContentItem, existing: Option<&str>) -> Value {
        let text_format = match item.format {
            ContentFormat::Html => "full_html",
            ContentFormat::Markdown => "markdown",
            ContentFormat::Text => "plain_text",
        };

        let mut data = json!({
            "type": format!("node--{}", self.bundle),
            "attributes": {
                "title": item.title,
                "body": { "value": item.body, "format": text_format },
                "status": true,
            },
        });
        if let Some(id) = existing {
            data["id"] = Value::String(id.to_string());
        }

        json!({ "data": data })
    }
}

#[async_trait]
impl Publisher for DrupalPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let collection = join_url(&self.site_url, &format!("jsonapi/node/{}", self.bundle));
        let existing = context.existing_remote_id.as_deref();

        let (method, url) = match existing {
            Some(id) => (Method::PATCH, format!("{collection}/{id}")),
            None => (Method::POST, collection),
        };

        let document = serde_json::to_vec(&self.document(item, existing))
            .map_err(|e| DeliveryError::internal(format!("failed to encode document: {e}")))?;
        let request = self
            .client
            .request(method, &url)?
            .header(CONTENT_TYPE, JSON_API)
            .header(reqwest::header::ACCEPT, JSON_API)
            .body(document);
        let request = authorize(request, &self.auth)?;

        let body = self.client.send(request, PROTOCOL).await?.json()?;
        let data = &body["data"];

        let remote_id = data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DeliveryError::invalid_response("JSON:API response has no data.id"))?;

        let published_url = data["attributes"]["path"]["alias"]
            .as_str()
            .filter(|alias| !alias.is_empty())
            .map(|alias| join_url(&self.site_url, alias))
            .or_else(|| data["links"]["self"]["href"].as_str().map(str::to_string));

        Ok(PublishOutcome { published_url, remote_id: Some(remote_id) })
    }

    async fn test_connection(&self) -> bool {
        let url = join_url(&self.site_url, "jsonapi");
        let Ok(request) = self.client.request(Method::GET, &url) else {
            return false;
        };
        let Ok(request) = authorize(request.header(reqwest::header::ACCEPT, JSON_API), &self.auth)
        else {
            return false;
        };
        self.client.reachable(request, PROTOCOL).await
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }
}
