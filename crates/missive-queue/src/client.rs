//! HTTP client for the external sender API.
//!
//! Each message is posted as `{recipient, message}` to
//! `<base-url>/<sender>/send` with a static `X-API-Key` header. A 2xx
//! response must carry a JSON body; that body, re-serialized, becomes the
//! stored delivery record.

use std::time::{Duration, Instant};

use missive_core::Message;
use reqwest::{header::HeaderMap, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the external API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Upper bound on response bytes kept for the delivery record.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Configuration for the sender API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL; the sender and `send` are appended as path segments.
    pub base_url: String,
    /// Static API key sent with every request.
    pub api_key: String,
    /// Timeout for a whole request, body included.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://wag.artakusuma.com/api/clients".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("missive/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Outbound request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Destination of the message.
    pub recipient: String,
    /// Message text.
    pub message: String,
}

/// A successful (2xx, JSON) response.
#[derive(Debug, Clone)]
pub struct SendResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Decoded JSON body, re-serialized.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// Client for the external sender API.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SenderClient {
    client: reqwest::Client,
    base_url: Url,
    config: ClientConfig,
}

impl SenderClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the base URL cannot be
    /// parsed or cannot carry path segments, or if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            DeliveryError::configuration(format!("invalid sender API URL '{}': {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DeliveryError::configuration(format!(
                "sender API URL '{}' cannot carry path segments",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, base_url, config })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds `<base-url>/<sender>/send`.
    ///
    /// The sender is percent-encoded as a single path segment.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::RequestBuild` for an empty sender.
    pub fn send_url(&self, sender: &str) -> Result<Url> {
        if sender.is_empty() {
            return Err(DeliveryError::request_build("sender is empty"));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DeliveryError::request_build("base URL cannot carry path segments"))?
            .pop_if_empty()
            .push(sender)
            .push("send");
        Ok(url)
    }

    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// - `RequestBuild` if the target URL cannot be derived
    /// - `NetworkError` / `Timeout` for transport failures
    /// - `ClientError`, `ServerError`, `RateLimited` for non-2xx responses,
    ///   carrying the response body
    /// - `ResponseDecode` for a 2xx response that is not JSON
    pub async fn send(&self, message: &Message) -> Result<SendResponse> {
        let url = self.send_url(&message.sender)?;
        let request = SendRequest {
            recipient: message.recipient.clone(),
            message: message.body.clone(),
        };

        let span = info_span!(
            "message_delivery",
            message_id = %message.id,
            sender = %message.sender,
            attempt = message.attempts + 1,
        );

        async move {
            tracing::debug!(url = %url, "sending message");
            let start = Instant::now();

            let response = self
                .client
                .post(url)
                .header(API_KEY_HEADER, &self.config.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| self.transport_error(&e))?;

            self.handle_response(response, start).await
        }
        .instrument(span)
        .await
    }

    fn transport_error(&self, e: &reqwest::Error) -> DeliveryError {
        tracing::warn!(error = %e, "request failed");

        if e.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if e.is_builder() {
            DeliveryError::request_build(e.to_string())
        } else if e.is_connect() {
            DeliveryError::network(format!("connection failed: {e}"))
        } else {
            DeliveryError::network(e.to_string())
        }
    }

    async fn handle_response(&self, response: Response, start: Instant) -> Result<SendResponse> {
        let status = response.status();
        let retry_after = extract_retry_after_seconds(response.headers());

        let bytes = response.bytes().await.map_err(|e| self.transport_error(&e))?;
        let duration = start.elapsed();
        let decoded = serde_json::from_slice::<serde_json::Value>(&bytes);

        tracing::debug!(
            status_code = status.as_u16(),
            duration_ms = duration.as_millis(),
            "received response"
        );

        if status.is_success() {
            let value =
                decoded.map_err(|e| DeliveryError::response_decode(e.to_string()))?;
            tracing::info!(status_code = status.as_u16(), "message delivered");
            return Ok(SendResponse {
                status_code: status.as_u16(),
                body: value.to_string(),
                duration,
            });
        }

        let body = match decoded {
            Ok(value) => value.to_string(),
            Err(_) => truncated_text(&bytes),
        };
        tracing::warn!(status_code = status.as_u16(), "sender API rejected message");

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => {
                DeliveryError::rate_limited(retry_after.unwrap_or(0), body)
            },
            s if s.is_server_error() => DeliveryError::server_error(s.as_u16(), body),
            s => DeliveryError::client_error(s.as_u16(), body),
        })
    }
}

fn truncated_text(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
        format!("{truncated}... (truncated)")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Reads a `Retry-After` header given in seconds.
pub fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}
