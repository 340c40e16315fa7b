//! Error types for queue processing.
//!
//! Delivery failures are never returned to a caller; they end up as the
//! `external_api_response` text of a FAILED message. The variants still
//! carry enough structure to decide whether a retry is worth scheduling.

use std::fmt;

use missive_core::CoreError;
use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures of delivery attempts, store access and worker supervision.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Transport failure before a response arrived.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Underlying transport error
        message: String,
    },

    /// The external API did not answer in time.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured request timeout
        timeout_seconds: u64,
    },

    /// Non-2xx response other than 5xx and 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body, decoded when possible
        body: String,
    },

    /// 5xx response.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body, decoded when possible
        body: String,
    },

    /// 429 response.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Value of the Retry-After header, 0 when absent
        retry_after_seconds: u64,
        /// Response body, decoded when possible
        body: String,
    },

    /// The outbound request could not be built.
    #[error("failed to build request: {message}")]
    RequestBuild {
        /// Reason the request could not be built
        message: String,
    },

    /// A 2xx response whose body was not JSON.
    #[error("Error decoding API response: {message}")]
    ResponseDecode {
        /// Decoder error
        message: String,
    },

    /// Bulk payload could not be expanded.
    #[error("invalid bulk payload: {message}")]
    InvalidPayload {
        /// Parse error
        message: String,
    },

    /// Store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid queue or client configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// A background task panicked.
    #[error("worker {worker} panicked: {message}")]
    WorkerPanic {
        /// Name of the task
        worker: String,
        /// Panic or join error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal queue error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after_seconds: u64, body: impl Into<String>) -> Self {
        Self::RateLimited { retry_after_seconds, body: body.into() }
    }

    /// Creates a request build error.
    pub fn request_build(message: impl Into<String>) -> Self {
        Self::RequestBuild { message: message.into() }
    }

    /// Creates a response decode error.
    pub fn response_decode(message: impl Into<String>) -> Self {
        Self::ResponseDecode { message: message.into() }
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a worker panic error.
    pub fn worker_panic(worker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkerPanic { worker: worker.into(), message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether a later attempt could plausibly succeed.
    ///
    /// Transport failures, timeouts, 5xx and 429 are transient. Request build
    /// errors, other non-2xx responses and undecodable bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::DatabaseError { .. } => true,

            Self::ClientError { .. }
            | Self::RequestBuild { .. }
            | Self::ResponseDecode { .. }
            | Self::InvalidPayload { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Server-provided retry delay, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds, .. } if *retry_after_seconds > 0 => {
                Some(*retry_after_seconds)
            },
            _ => None,
        }
    }

    /// Text stored as the message's `external_api_response`.
    ///
    /// HTTP failures store the response body so the record shows what the
    /// external API said; everything else stores the error description.
    pub fn response_text(&self) -> String {
        match self {
            Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::RateLimited { body, .. }
                if !body.is_empty() =>
            {
                body.clone()
            },
            other => other.to_string(),
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::InvalidPayload { message },
            other => Self::DatabaseError { message: other.to_string() },
        }
    }
}

/// Category of a queue error, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// 4xx responses and unusable requests or responses.
    Client,
    /// 5xx responses.
    Server,
    /// 429 responses.
    RateLimit,
    /// Malformed bulk payloads.
    Payload,
    /// Store operations.
    Database,
    /// Configuration problems.
    Configuration,
    /// Supervision and internal faults.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. }
            | DeliveryError::RequestBuild { .. }
            | DeliveryError::ResponseDecode { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::InvalidPayload { .. } => Self::Payload,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Payload => write!(f, "payload"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(500, "oops").is_retryable());
        assert!(DeliveryError::rate_limited(60, "").is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::request_build("bad url").is_retryable());
        assert!(!DeliveryError::response_decode("expected value").is_retryable());
        assert!(!DeliveryError::invalid_payload("missing field").is_retryable());
    }

    #[test]
    fn retry_after_only_when_positive() {
        assert_eq!(DeliveryError::rate_limited(120, "").retry_after_seconds(), Some(120));
        assert_eq!(DeliveryError::rate_limited(0, "").retry_after_seconds(), None);
        assert_eq!(DeliveryError::timeout(30).retry_after_seconds(), None);
    }

    #[test]
    fn response_text_prefers_http_body() {
        let err = DeliveryError::server_error(500, r#"{"error":"down"}"#);
        assert_eq!(err.response_text(), r#"{"error":"down"}"#);

        let err = DeliveryError::client_error(404, "");
        assert_eq!(err.response_text(), "client error: HTTP 404");

        let err = DeliveryError::rate_limited(30, r#"{"error":"quota exceeded"}"#);
        assert_eq!(err.response_text(), r#"{"error":"quota exceeded"}"#);

        let err = DeliveryError::rate_limited(30, "");
        assert_eq!(err.response_text(), "rate limited: retry after 30s");

        let err = DeliveryError::response_decode("expected value at line 1");
        assert_eq!(err.response_text(), "Error decoding API response: expected value at line 1");
    }

    #[test]
    fn core_errors_convert_by_kind() {
        let err = DeliveryError::from(CoreError::InvalidInput("no recipients".into()));
        assert!(matches!(err, DeliveryError::InvalidPayload { .. }));

        let err = DeliveryError::from(CoreError::Database("pool timed out".into()));
        assert!(matches!(err, DeliveryError::DatabaseError { .. }));
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(1)), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::response_decode("x")),
            ErrorCategory::Client
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::server_error(502, "")), ErrorCategory::Server);
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::worker_panic("delivery", "boom").to_string(),
            "worker delivery panicked: boom"
        );
    }
}
