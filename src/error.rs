//! Error types
//!
//! [`DatabaseError`] is what the pool, the manager and the credential
//! verifier return. [`AppError`] is the HTTP-facing error: it logs internal
//! details and hands clients a safe JSON body.
//!
//! ```ignore
//! async fn handler(State(state): State<AppState>) -> Result<Json<PoolStatus>, AppError> {
//!     let status = state.db.status().await;
//!     Ok(Json(status))
//! }
//!
//! // Database failures surface as
//! // 503 {"error": "service_unavailable", "message": "Database unavailable"}
//! ```

use std::fmt;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

// ============================================================================
// Database errors
// ============================================================================

/// Failures raised by the connection layer.
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    /// Invalid or inconsistent configuration
    #[error("database configuration error: {0}")]
    Configuration(String),

    /// A single connection attempt failed
    #[error("failed to connect to database: {0}")]
    Connect(String),

    /// Every pool creation attempt failed
    #[error("database unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// No pool slot freed up within the acquire timeout
    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    /// The pool was closed while the caller was using or waiting on it
    #[error("connection pool is closed")]
    PoolClosed,

    /// The manager was shut down; no further pools will be created
    #[error("database manager has been shut down")]
    ShutDown,

    /// The statement itself failed; the session is still usable
    #[error("query failed: {0}")]
    Query(String),

    /// The session broke mid-use and must be discarded
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl DatabaseError {
    /// True when the database itself could not be reached, as opposed to a
    /// statement or pool-bookkeeping failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Unavailable { .. } | Self::ConnectionLost(_)
        )
    }
}

// ============================================================================
// HTTP errors
// ============================================================================

/// Application error returned by the HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    /// Error kind determines HTTP status and handling
    pub kind: ErrorKind,
    /// User-facing message (safe to expose)
    pub message: String,
    /// Internal details (logged, never sent)
    pub details: Option<String>,
    /// Seconds until the client may retry, sent as `Retry-After`
    pub retry_after: Option<u64>,
}

/// Error categories with their HTTP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 400
    BadRequest,
    /// 401
    Unauthorized,
    /// 429, login lockout in effect
    LockedOut,
    /// 500
    Internal,
    /// 503
    Unavailable,
}

impl ErrorKind {
    /// Get the HTTP status code for this error kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::LockedOut => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest => write!(f, "bad_request"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::LockedOut => write!(f, "too_many_attempts"),
            Self::Internal => write!(f, "internal_error"),
            Self::Unavailable => write!(f, "service_unavailable"),
        }
    }
}

impl AppError {
    /// Create a new error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    /// Create a bad request error (400)
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Create an unauthorized error (401)
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Login lockout (429) with the remaining seconds
    pub fn locked_out(remaining_secs: u64) -> Self {
        Self {
            retry_after: Some(remaining_secs),
            ..Self::new(
                ErrorKind::LockedOut,
                format!(
                    "Account temporarily locked. Try again in {} seconds.",
                    remaining_secs
                ),
            )
        }
    }

    /// Create an internal error (500); the details are logged only
    pub fn internal(message: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, message).with_details(details.to_string())
    }

    /// Create a service unavailable error (503)
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Add internal details (logged but not exposed)
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn log(&self) {
        let details = self.details.as_deref().unwrap_or("none");

        match self.kind {
            ErrorKind::Internal | ErrorKind::Unavailable => {
                tracing::error!(
                    error_kind = %self.kind,
                    message = %self.message,
                    details = %details,
                    "Request failed"
                );
            }
            ErrorKind::Unauthorized | ErrorKind::LockedOut => {
                tracing::warn!(error_kind = %self.kind, message = %self.message, "Auth error");
            }
            ErrorKind::BadRequest => {
                tracing::debug!(error_kind = %self.kind, message = %self.message, "Client error");
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

/// JSON error response format
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// Seconds until retry is allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.kind.status_code();
        let body = ErrorResponse {
            error: self.kind.to_string(),
            message: self.message,
            retry_after: self.retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Query(_) | DatabaseError::Configuration(_) => {
                AppError::internal("Database error", err)
            }
            other => AppError::unavailable("Database unavailable").with_details(other.to_string()),
        }
    }
}

/// Result type alias for handlers returning AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_status_codes() {
        assert_eq!(ErrorKind::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::LockedOut.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::Unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_locked_out_carries_retry_after() {
        let err = AppError::locked_out(42);
        assert_eq!(err.retry_after, Some(42));
        assert!(err.message.contains("42 seconds"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_database_error_mapping() {
        let err: AppError = DatabaseError::Unavailable {
            attempts: 3,
            last_error: "connection refused".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.message, "Database unavailable");

        let err: AppError = DatabaseError::Query("syntax error".into()).into();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.details.as_deref(), Some("query failed: syntax error"));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(DatabaseError::Connect("refused".into()).is_connectivity());
        assert!(DatabaseError::ConnectionLost("reset".into()).is_connectivity());
        assert!(!DatabaseError::Query("bad".into()).is_connectivity());
        assert!(!DatabaseError::PoolClosed.is_connectivity());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::unauthorized("Invalid username or password.");
        assert_eq!(format!("{}", err), "unauthorized: Invalid username or password.");
    }
}
