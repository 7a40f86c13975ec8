//! Test data builders for content items and destinations.

use chrono::{DateTime, Utc};
use courier_core::{
    AuthConfig, ContentFormat, ContentItem, ContentStatus, Destination, DestinationId,
    DestinationKind,
};

/// Builder for content items.
#[derive(Debug, Clone)]
pub struct ContentItemBuilder {
    title: String,
    body: String,
    format: ContentFormat,
    author: Option<String>,
    source_url: Option<String>,
    platform: Option<String>,
    tags: Vec<String>,
    published: Option<(DestinationId, String, Option<String>)>,
}

impl Default for ContentItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentItemBuilder {
    /// A Markdown item titled "Test item".
    pub fn new() -> Self {
        Self {
            title: "Test item".to_string(),
            body: "Saved for later.".to_string(),
            format: ContentFormat::Markdown,
            author: None,
            source_url: None,
            platform: None,
            tags: Vec::new(),
            published: None,
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the body format.
    #[must_use]
    pub fn format(mut self, format: ContentFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the author.
    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Sets the source URL.
    #[must_use]
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Sets the originating platform.
    #[must_use]
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Marks the item as already published to `destination`.
    #[must_use]
    pub fn published_to(
        mut self,
        destination: DestinationId,
        remote_id: impl Into<String>,
        url: Option<&str>,
    ) -> Self {
        self.published = Some((destination, remote_id.into(), url.map(str::to_string)));
        self
    }

    /// Builds the item with `created_at = now`.
    pub fn build(self, now: DateTime<Utc>) -> ContentItem {
        let mut item = ContentItem::new(self.title, self.body, now);
        item.format = self.format;
        item.author = self.author;
        item.source_url = self.source_url;
        item.platform = self.platform;
        item.tags = self.tags;

        if let Some((destination, remote_id, url)) = self.published {
            item.status = ContentStatus::Published;
            item.destination_id = Some(destination);
            item.remote_id = Some(remote_id);
            item.published_url = url;
            item.published_at = Some(now);
        }
        item
    }
}

/// Builder for destinations.
#[derive(Debug, Clone)]
pub struct DestinationBuilder {
    name: String,
    kind: DestinationKind,
    auth: AuthConfig,
    enabled: bool,
    is_default: bool,
}

impl Default for DestinationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationBuilder {
    /// An enabled local destination.
    pub fn new() -> Self {
        Self {
            name: "Test destination".to_string(),
            kind: DestinationKind::Local,
            auth: AuthConfig::None,
            enabled: true,
            is_default: false,
        }
    }

    /// A webhook destination posting to `url`.
    pub fn webhook(url: impl Into<String>) -> Self {
        Self::new().kind(DestinationKind::Webhook {
            url: url.into(),
            method: "POST".to_string(),
            payload_template: None,
            url_path: None,
            id_path: None,
            headers: Default::default(),
        })
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the protocol kind.
    #[must_use]
    pub fn kind(mut self, kind: DestinationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Disables the destination.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Marks the destination as a default target.
    #[must_use]
    pub fn default_target(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Builds the destination with `created_at = now`.
    pub fn build(self, now: DateTime<Utc>) -> Destination {
        let mut destination = Destination::new(self.name, self.kind, now);
        destination.auth = self.auth;
        destination.enabled = self.enabled;
        destination.is_default = self.is_default;
        destination
    }
}
