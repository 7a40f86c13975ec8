//! Error types for delivery and queue operations.
//!
//! [`DeliveryError`] describes why a single publish attempt failed and
//! carries the classification the retry strategy relies on.
//! [`QueueError`] is returned by the queue manager's public operations.

use std::fmt;

use courier_core::{CoreError, JobId, JobStatus};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// HTTP status codes that retries cannot fix.
const NON_RETRYABLE_STATUS: [u16; 4] = [401, 403, 404, 422];

/// Why a publish attempt failed.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Remote answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Remote answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Remote asked us to slow down.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Credentials missing or rejected.
    #[error("authentication failed: {message}")]
    Authentication {
        /// What was rejected
        message: String,
    },

    /// The job or its inputs are invalid.
    #[error("validation failed: {message}")]
    Validation {
        /// What is invalid
        message: String,
    },

    /// A referenced remote or local entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// The remote answered with something we could not interpret.
    #[error("invalid response: {message}")]
    InvalidResponse {
        /// Parse failure detail
        message: String,
    },

    /// Destination configuration cannot produce a request.
    #[error("invalid destination configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Local filesystem failure.
    #[error("i/o error: {message}")]
    Io {
        /// I/O error message
        message: String,
    },

    /// Storage operation failed during delivery.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
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

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<u64>) -> Self {
        match status_code {
            429 => Self::rate_limited(retry_after.unwrap_or(0)),
            400..=499 => Self::client_error(status_code, body),
            500..=599 => Self::server_error(status_code, body),
            _ => Self::invalid_response(format!("unexpected HTTP status {status_code}")),
        }
    }

    /// HTTP status code if the remote responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Determines if a retry could succeed.
    ///
    /// Authentication, validation, not-found and configuration failures, and
    /// HTTP 401/403/404/422, are permanent. Everything else, including
    /// unknown internal failures, is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ClientError { status_code, .. } => !NON_RETRYABLE_STATUS.contains(status_code),

            Self::Authentication { .. }
            | Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::ConfigurationError { .. } => false,

            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::InvalidResponse { .. }
            | Self::Io { .. }
            | Self::DatabaseError { .. }
            | Self::InternalError { .. } => true,
        }
    }

    /// Returns the server-requested delay in seconds, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } if *retry_after_seconds > 0 => {
                Some(*retry_after_seconds)
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::not_found(message),
            CoreError::InvalidInput(message) => Self::validation(message),
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for logs and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Credentials rejected.
    Authentication,
    /// Invalid job, input or configuration.
    Validation,
    /// Missing entity.
    NotFound,
    /// Storage or filesystem.
    Storage,
    /// Unparseable responses and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { status_code: 401 | 403, .. }
            | DeliveryError::Authentication { .. } => Self::Authentication,
            DeliveryError::ClientError { status_code: 404, .. } | DeliveryError::NotFound { .. } => {
                Self::NotFound
            },
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::Validation { .. } | DeliveryError::ConfigurationError { .. } => {
                Self::Validation
            },
            DeliveryError::Io { .. } | DeliveryError::DatabaseError { .. } => Self::Storage,
            DeliveryError::InvalidResponse { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
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
            Self::Authentication => write!(f, "authentication"),
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Storage => write!(f, "storage"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors returned by queue manager operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A referenced job, content item or destination does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of entity
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The job is in a state that does not allow the operation.
    #[error("job {job_id} is {status}; expected {expected}")]
    InvalidState {
        /// Job that was addressed
        job_id: JobId,
        /// Its current status
        status: JobStatus,
        /// Status the operation requires
        expected: JobStatus,
    },

    /// An active job already exists for the (content item, destination) pair.
    #[error("job {existing} is already queued for this content and destination")]
    DuplicateJob {
        /// The active job
        existing: JobId,
    },

    /// Invalid request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Publisher could not be built for a destination.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl QueueError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}
