//! Generic webhook publisher.
//!
//! The request body is either the serialized item or a JSON template with
//! `{{field}}` placeholders. Placeholders are replaced with JSON-escaped
//! text, so they belong inside string literals: `{"text": "{{title}}"}`.
//! Optional dotted paths (`data.post.url`, `items.0.id`) pull the published
//! URL and remote id out of the response body.

use std::collections::BTreeMap;

use async_trait::async_trait;
use courier_core::{AuthConfig, ContentItem, DestinationKind};
use reqwest::{header::CONTENT_TYPE, Method};
use serde_json::Value;

use super::{
    auth::{authorize, header_name, header_value},
    PublishContext, PublishOutcome, Publisher,
};
use crate::{
    client::{parse_url, HttpClient},
    error::{DeliveryError, Result},
};

const PROTOCOL: &str = "webhook";

/// Sends items to an arbitrary HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: HttpClient,
    url: String,
    method: Method,
    payload_template: Option<String>,
    url_path: Option<String>,
    id_path: Option<String>,
    headers: BTreeMap<String, String>,
    auth: AuthConfig,
}

impl WebhookPublisher {
    /// Creates a publisher from a `Webhook` destination kind.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for a non-webhook kind, a malformed URL,
    /// or an unknown method.
    pub fn from_kind(client: HttpClient, kind: &DestinationKind, auth: AuthConfig) -> Result<Self> {
        let DestinationKind::Webhook { url, method, payload_template, url_path, id_path, headers } =
            kind
        else {
            return Err(DeliveryError::configuration(format!(
                "expected webhook destination, got {}",
                kind.protocol()
            )));
        };

        parse_url(url)?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| DeliveryError::configuration(format!("invalid HTTP method {method:?}")))?;

        Ok(Self {
            client,
            url: url.clone(),
            method,
            payload_template: payload_template.clone(),
            url_path: url_path.clone(),
            id_path: id_path.clone(),
            headers: headers.clone(),
            auth,
        })
    }

    fn body(&self, item: &ContentItem, context: &PublishContext) -> Result<String> {
        match &self.payload_template {
            Some(template) => {
                let rendered = render_template(template, item, context);
                serde_json::from_str::<Value>(&rendered).map_err(|e| {
                    DeliveryError::configuration(format!("payload template is not valid JSON: {e}"))
                })?;
                Ok(rendered)
            },
            None => serde_json::to_string(item)
                .map_err(|e| DeliveryError::internal(format!("failed to encode item: {e}"))),
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.url)?
            .header(CONTENT_TYPE, "application/json")
            .body(self.body(item, context)?);
        for (name, value) in &self.headers {
            request = request.header(header_name(name)?, header_value(value)?);
        }
        let request = authorize(request, &self.auth)?;

        let response = self.client.send(request, PROTOCOL).await?;

        if self.url_path.is_none() && self.id_path.is_none() {
            return Ok(PublishOutcome::default());
        }

        let body = response.json()?;
        Ok(PublishOutcome {
            published_url: self.url_path.as_deref().and_then(|path| extract_path(&body, path)),
            remote_id: self.id_path.as_deref().and_then(|path| extract_path(&body, path)),
        })
    }

    async fn test_connection(&self) -> bool {
        let Ok(request) = self.client.request(Method::HEAD, &self.url) else {
            return false;
        };
        let Ok(request) = authorize(request, &self.auth) else {
            return false;
        };
        match self.client.send(request, PROTOCOL).await {
            Ok(_) => true,
            // Reachable; many hooks only accept POST.
            Err(DeliveryError::ClientError { status_code, .. }) => {
                !matches!(status_code, 401 | 403 | 404)
            },
            Err(_) => false,
        }
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }
}

/// Replaces `{{field}}` placeholders with JSON-escaped item fields.
///
/// Unknown placeholders are left as they are.
pub fn render_template(template: &str, item: &ContentItem, context: &PublishContext) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };

        let name = after[..end].trim();
        match field_value(name, item, context) {
            Some(value) => output.push_str(&escape_json(&value)),
            None => output.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    output.push_str(rest);
    output
}

fn field_value(name: &str, item: &ContentItem, context: &PublishContext) -> Option<String> {
    let value = match name {
        "id" => item.id.to_string(),
        "title" => item.title.clone(),
        "body" | "content" => item.body.clone(),
        "format" => item.format.as_str().to_string(),
        "author" => item.author.clone().unwrap_or_default(),
        "source_url" | "url" => item.source_url.clone().unwrap_or_default(),
        "platform" => item.platform.clone().unwrap_or_default(),
        "tags" => item.tags.join(", "),
        "created_at" => item.created_at.to_rfc3339(),
        "remote_id" => context.existing_remote_id.clone().unwrap_or_default(),
        _ => return None,
    };
    Some(value)
}

fn escape_json(value: &str) -> String {
    let quoted = Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Follows a dotted path through objects and arrays. Numbers are returned
/// as their decimal text.
pub fn extract_path(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
