//! Federation publisher pushing ActivityStreams `Create` activities.
//!
//! Requests are not signed; inboxes that require HTTP signatures reject
//! them with 401, which fails the job without retries.

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{AuthConfig, ContentFormat, ContentItem};
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Method,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{auth::authorize, PublishContext, PublishOutcome, Publisher};
use crate::{
    client::{parse_url, HttpClient},
    error::{DeliveryError, Result},
};

const PROTOCOL: &str = "activitypub";
const ACTIVITY_JSON: &str = "application/activity+json";
const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Posts notes to an actor's inbox.
#[derive(Debug, Clone)]
pub struct ActivityPubPublisher {
    client: HttpClient,
    inbox_url: String,
    actor_id: String,
    auth: AuthConfig,
}

impl ActivityPubPublisher {
    /// Creates a publisher delivering to `inbox_url` as `actor_id`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if either URL is malformed.
    pub fn new(
        client: HttpClient,
        inbox_url: &str,
        actor_id: &str,
        auth: AuthConfig,
    ) -> Result<Self> {
        parse_url(inbox_url)?;
        parse_url(actor_id)?;
        Ok(Self {
            client,
            inbox_url: inbox_url.to_string(),
            actor_id: actor_id.trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// Object id for `item`, stable across deliveries.
    pub fn note_id(&self, item: &ContentItem) -> String {
        format!("{}/notes/{}", self.actor_id, item.id)
    }

    fn activity(&self, item: &ContentItem, context: &PublishContext) -> Value {
        let note_id =
            context.existing_remote_id.clone().unwrap_or_else(|| self.note_id(item));
        let activity_type = if context.existing_remote_id.is_some() { "Update" } else { "Create" };

        let content = match item.format {
            ContentFormat::Html => item.body.clone(),
            ContentFormat::Text | ContentFormat::Markdown => {
                format!("<p>{}</p>", escape_html(&item.body))
            },
        };
        let tags: Vec<Value> = item
            .tags
            .iter()
            .map(|tag| json!({ "type": "Hashtag", "name": format!("#{tag}") }))
            .collect();

        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/activities/{}", self.actor_id, Uuid::new_v4()),
            "type": activity_type,
            "actor": self.actor_id,
            "published": Utc::now().to_rfc3339(),
            "to": [PUBLIC],
            "object": {
                "id": note_id,
                "type": "Note",
                "attributedTo": self.actor_id,
                "name": item.title,
                "content": content,
                "url": item.source_url,
                "published": item.created_at.to_rfc3339(),
                "to": [PUBLIC],
                "tag": tags,
            },
        })
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl Publisher for ActivityPubPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let activity = self.activity(item, context);
        let note_id = activity["object"]["id"].as_str().map(str::to_string);

        let body = serde_json::to_vec(&activity)
            .map_err(|e| DeliveryError::internal(format!("failed to encode activity: {e}")))?;
        let request = self
            .client
            .request(Method::POST, &self.inbox_url)?
            .header(CONTENT_TYPE, ACTIVITY_JSON)
            .body(body);
        let request = authorize(request, &self.auth)?;

        let response = self.client.send(request, PROTOCOL).await?;
        let published_url =
            response.header("location").map(str::to_string).or_else(|| note_id.clone());

        Ok(PublishOutcome { published_url, remote_id: note_id })
    }

    async fn test_connection(&self) -> bool {
        let Ok(request) = self.client.request(Method::GET, &self.actor_id) else {
            return false;
        };
        let Ok(request) = authorize(request.header(ACCEPT, ACTIVITY_JSON), &self.auth) else {
            return false;
        };
        self.client.reachable(request, PROTOCOL).await
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> ActivityPubPublisher {
        ActivityPubPublisher::new(
            HttpClient::with_defaults().unwrap(),
            "https://social.example.com/inbox",
            "https://social.example.com/users/reader/",
            AuthConfig::None,
        )
        .unwrap()
    }

    #[test]
    fn create_activity_wraps_note() {
        let mut item = ContentItem::new("Title", "a < b", Utc::now());
        item.format = ContentFormat::Text;
        item.tags = vec!["rust".into()];

        let activity = publisher().activity(&item, &PublishContext::default());

        assert_eq!(activity["type"], "Create");
        assert_eq!(activity["actor"], "https://social.example.com/users/reader");
        assert_eq!(activity["object"]["type"], "Note");
        assert_eq!(activity["object"]["content"], "<p>a &lt; b</p>");
        assert_eq!(activity["object"]["tag"][0]["name"], "#rust");
        assert_eq!(activity["object"]["id"], publisher().note_id(&item));
    }

    #[test]
    fn existing_remote_id_sends_update() {
        let item = ContentItem::new("Title", "body", Utc::now());
        let context = PublishContext { existing_remote_id: Some("https://x/notes/1".into()) };

        let activity = publisher().activity(&item, &context);
        assert_eq!(activity["type"], "Update");
        assert_eq!(activity["object"]["id"], "https://x/notes/1");
    }
}
