//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Structured Storage Errors
// ============================================================================

/// Storage operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOperation {
    /// Establishing a connection or acquiring one from the pool
    Connect,
    /// Executing a query
    Query,
    /// Inserting rows
    Insert,
    /// Updating rows
    Update,
    /// Deleting rows
    Delete,
    /// Transaction operations (begin, commit, rollback)
    Transaction,
    /// Running schema migrations
    Migration,
}

impl fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Query => write!(f, "query"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Transaction => write!(f, "transaction"),
            Self::Migration => write!(f, "migration"),
        }
    }
}

/// Category of storage error
///
/// The four kinds callers are expected to branch on: conflicts surface as
/// HTTP 409, not-found as 404, unavailability is retryable, and a stale
/// schema aborts startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// Unique or foreign-key constraint violation
    Conflict,
    /// Row not found
    NotFound,
    /// Engine unreachable, timed out, or pool exhausted (retryable)
    Unavailable,
    /// Applied schema versions do not match the merged migration set
    SchemaStale,
    /// Anything else (query syntax, type conversion)
    Other,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not_found"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::SchemaStale => write!(f, "schema_stale"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured storage error with operation context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage {kind} error during {operation}: {message}")]
pub struct StorageError {
    /// The operation being performed when the error occurred
    pub operation: StorageOperation,
    /// The category of error
    pub kind: StorageErrorKind,
    /// Human-readable error message
    pub message: String,
}

impl StorageError {
    /// Create a new storage error
    pub fn new(
        operation: StorageOperation,
        kind: StorageErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(operation: StorageOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StorageErrorKind::Conflict, message)
    }

    /// Create a not-found error
    pub fn not_found(operation: StorageOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StorageErrorKind::NotFound, message)
    }

    /// Create an unavailable error
    pub fn unavailable(operation: StorageOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StorageErrorKind::Unavailable, message)
    }

    /// Create a stale-schema error
    pub fn schema_stale(message: impl Into<String>) -> Self {
        Self::new(
            StorageOperation::Migration,
            StorageErrorKind::SchemaStale,
            message,
        )
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Unavailable)
    }
}

// ============================================================================
// Crypto / Barrier / Session / Policy Errors
// ============================================================================

/// Errors from the crypto primitive layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key id not present in any reachable key set
    #[error("unknown kid: {0}")]
    UnknownKid(String),
    /// Signature verification failed
    #[error("bad signature")]
    BadSignature,
    /// Ciphertext failed to parse or authenticate
    #[error("bad ciphertext: {0}")]
    BadCiphertext(String),
    /// Algorithm name not present in the registry
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Key generation or encoding failed
    #[error("key error: {0}")]
    Key(String),
}

/// Errors from the barrier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// The barrier has not been unsealed (or unsealing failed)
    #[error("barrier is sealed")]
    Sealed,
    /// An unseal share failed to decrypt the root key bundle
    #[error("invalid unseal share combination")]
    UnsealShareInvalid,
    /// A rotation at the same level is already holding the write lock
    #[error("rotation already in progress")]
    RotationInProgress,
}

/// Enumerated session validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Token failed to parse as compact JWS/JWE
    #[error("session token malformed")]
    Malformed,
    /// Signature or authentication tag did not verify
    #[error("session token signature invalid")]
    Signature,
    /// Token is outside its validity window
    #[error("session token expired")]
    Expired,
    /// The backing session key was purged while the token was live
    #[error("session token revoked")]
    Revoked,
    /// Token header references a kid with no key row
    #[error("session token references unknown kid")]
    UnknownKid,
    /// Audience claim does not match this service
    #[error("session token audience mismatch")]
    WrongAudience,
}

/// Policy rejections produced by the middleware chains
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Token bucket exhausted for this tenant or remote address
    #[error("rate limited")]
    RateLimited,
    /// Origin not present in the CORS allow-list
    #[error("origin not allowed: {0}")]
    ForbiddenOrigin(String),
    /// Remote address not present in the IP allow-list
    #[error("address not allowed: {0}")]
    ForbiddenIp(String),
}

// ============================================================================
// Main Error
// ============================================================================

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the service template
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing or invalid options)
    #[error("configuration error: {0}")]
    Config(String),

    /// Structured storage error with operation context
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Crypto primitive error
    #[error("{0}")]
    Crypto(#[from] CryptoError),

    /// Barrier error
    #[error("{0}")]
    Barrier(#[from] BarrierError),

    /// Session validation error
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Policy rejection (rate limit, origin, address)
    #[error("{0}")]
    Policy(#[from] PolicyError),

    /// Per-request or outbound-call deadline exceeded
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Authentication error
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource conflict (409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for startup failures (spec'd by the deploy tooling:
    /// 0 normal, 1 configuration, 2 unseal, 3 migration, 4 runtime).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Barrier(BarrierError::Sealed)
            | Error::Barrier(BarrierError::UnsealShareInvalid) => 2,
            Error::Storage(e) if e.operation == StorageOperation::Migration => 3,
            _ => 4,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Error response body
///
/// `error` is the machine-readable code; `message` is for humans.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: String,

    /// Human-readable message
    pub message: String,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),

            Error::Storage(e) => {
                tracing::error!(
                    operation = %e.operation,
                    kind = %e.kind,
                    retriable = e.is_retriable(),
                    "storage error: {}", e.message
                );
                let (status, code, message) = match e.kind {
                    StorageErrorKind::NotFound => {
                        (StatusCode::NOT_FOUND, "not_found", "resource not found")
                    }
                    StorageErrorKind::Conflict => (
                        StatusCode::CONFLICT,
                        "conflict",
                        "operation conflicts with existing data",
                    ),
                    StorageErrorKind::Unavailable => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "storage_unavailable",
                        "storage temporarily unavailable",
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "storage_error",
                        "storage operation failed",
                    ),
                };
                (status, code, message.to_string())
            }

            Error::Crypto(e) => {
                let (status, code) = match e {
                    CryptoError::UnknownKid(_) => (StatusCode::NOT_FOUND, "unknown_kid"),
                    CryptoError::BadSignature => (StatusCode::BAD_REQUEST, "bad_signature"),
                    CryptoError::BadCiphertext(_) => (StatusCode::BAD_REQUEST, "bad_ciphertext"),
                    CryptoError::UnsupportedAlgorithm(_) => {
                        (StatusCode::BAD_REQUEST, "unsupported_algorithm")
                    }
                    CryptoError::Key(_) => (StatusCode::INTERNAL_SERVER_ERROR, "key_error"),
                };
                (status, code, e.to_string())
            }

            Error::Barrier(e) => {
                tracing::error!("barrier error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "barrier_error",
                    e.to_string(),
                )
            }

            Error::Session(e) => {
                let code = match e {
                    SessionError::Malformed => "session_malformed",
                    SessionError::Signature => "session_signature",
                    SessionError::Expired => "session_expired",
                    SessionError::Revoked => "session_revoked",
                    SessionError::UnknownKid => "session_unknown_kid",
                    SessionError::WrongAudience => "session_wrong_audience",
                };
                (StatusCode::UNAUTHORIZED, code, e.to_string())
            }

            Error::Policy(e) => match e {
                PolicyError::RateLimited => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "too many requests".to_string(),
                ),
                PolicyError::ForbiddenOrigin(_) => {
                    (StatusCode::FORBIDDEN, "forbidden_origin", e.to_string())
                }
                PolicyError::ForbiddenIp(_) => {
                    (StatusCode::FORBIDDEN, "forbidden_ip", e.to_string())
                }
            },

            Error::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, "timeout", msg.clone()),

            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),

            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone()),

            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),

            Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),

            Error::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "I/O operation failed".to_string(),
                )
            }

            Error::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };

        let body = ErrorResponse::new(status, code, message);
        (status, Json(body)).into_response()
    }
}

/// Map a sqlx error into the structured storage error for the given operation.
pub fn map_sqlx_error(operation: StorageOperation, e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::RowNotFound => StorageError::not_found(operation, e.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            StorageError::conflict(operation, db.message().to_string())
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::unavailable(operation, e.to_string()),
        _ => StorageError::new(operation, StorageErrorKind::Other, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_unavailable_is_retriable() {
        let e = StorageError::unavailable(StorageOperation::Query, "pool timed out");
        assert!(e.is_retriable());
        let e = StorageError::conflict(StorageOperation::Insert, "duplicate kid");
        assert!(!e.is_retriable());
    }

    #[test]
    fn exit_codes_follow_failure_class() {
        assert_eq!(Error::Config("missing port".into()).exit_code(), 1);
        assert_eq!(Error::Barrier(BarrierError::Sealed).exit_code(), 2);
        assert_eq!(
            Error::Storage(StorageError::schema_stale("duplicate version 2001")).exit_code(),
            3
        );
        assert_eq!(Error::Internal("boom".into()).exit_code(), 4);
    }

    #[test]
    fn session_errors_map_to_unauthorized() {
        let resp = Error::Session(SessionError::Expired).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn policy_rate_limit_maps_to_429() {
        let resp = Error::Policy(PolicyError::RateLimited).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
