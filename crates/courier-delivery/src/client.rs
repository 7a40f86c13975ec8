//! Shared HTTP client for publishers.
//!
//! Wraps a pooled `reqwest` client with a fixed timeout and user agent, and
//! turns transport failures and non-2xx responses into [`DeliveryError`]s so
//! every HTTP publisher classifies failures the same way.

use std::{collections::HashMap, time::Duration};

use reqwest::{header::HeaderMap, Method, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Bodies larger than this are truncated before they are kept in errors.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Retry-After value assumed when the header is present but unparseable.
const DEFAULT_RETRY_AFTER: u64 = 60;

/// Configuration for the publisher HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a whole request, connect to last body byte.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 5,
        }
    }
}

/// A completed 2xx response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, truncated past 64 KiB.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

impl HttpResponse {
    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` if the body is not JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| DeliveryError::invalid_response(format!("expected JSON body: {e}")))
    }
}

/// HTTP client shared by all publishers of a factory.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the underlying client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the underlying client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts a request after validating `url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `url` is not an absolute URL.
    pub fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let url = parse_url(url)?;
        Ok(self.client.request(method, url))
    }

    /// Sends a request and requires a 2xx response.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the configured timeout elapses
    /// - `NetworkError` for connection and transport failures
    /// - `RateLimited` for 429, honouring `Retry-After`
    /// - `ClientError` / `ServerError` for other 4xx / 5xx statuses
    pub async fn send(&self, request: RequestBuilder, protocol: &'static str) -> Result<HttpResponse> {
        let span = info_span!("publish_request", protocol);

        async move {
            let start = std::time::Instant::now();

            let response = request.send().await.map_err(|e| {
                warn!(duration_ms = start.elapsed().as_millis(), error = %e, "request failed");
                self.transport_error(&e)
            })?;

            let status_code = response.status().as_u16();
            let response = read_response(response, start.elapsed()).await;
            debug!(
                status = status_code,
                duration_ms = response.duration.as_millis(),
                "received response"
            );

            if (200..300).contains(&status_code) {
                return Ok(response);
            }

            warn!(status = status_code, "remote rejected request");
            let retry_after = extract_retry_after_seconds(&response.headers);
            Err(DeliveryError::from_status(
                status_code,
                truncate(&response.body, MAX_ERROR_BODY_SIZE),
                retry_after,
            ))
        }
        .instrument(span)
        .await
    }

    /// Sends a request and reports whether it returned 2xx.
    pub async fn reachable(&self, request: RequestBuilder, protocol: &'static str) -> bool {
        match self.send(request, protocol).await {
            Ok(_) => true,
            Err(e) => {
                debug!(protocol, error = %e, "connection test failed");
                false
            },
        }
    }

    fn transport_error(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            return DeliveryError::timeout(self.config.timeout.as_secs());
        }
        if error.is_connect() {
            return DeliveryError::network(format!("connection failed: {error}"));
        }
        if error.is_builder() {
            return DeliveryError::configuration(error.to_string());
        }
        DeliveryError::network(error.to_string())
    }
}

/// Parses an absolute http(s) URL.
///
/// # Errors
///
/// Returns `ConfigurationError` for malformed or non-HTTP URLs.
pub fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| DeliveryError::configuration(format!("invalid URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DeliveryError::configuration(format!("unsupported URL scheme {other:?}"))),
    }
}

/// Joins a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn read_response(response: Response, elapsed: Duration) -> HttpResponse {
    let status_code = response.status().as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "failed to read response body");
            String::new()
        },
    };

    HttpResponse { status_code, headers, body, duration: elapsed }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|v| (key.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Extracts the Retry-After delay in seconds.
///
/// Supports delta-seconds and HTTP-date values. An unparseable header yields
/// a 60 second default; a missing header yields `None`.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after")?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let remaining = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(remaining.to_std().map(|d| d.as_secs()).unwrap_or(0));
    }

    Some(DEFAULT_RETRY_AFTER)
}
