//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the core returns `AppError`, which is a
//! closed mapping onto the seven error kinds the wire layer and background
//! tasks branch on. Variants carry enough context to render a
//! `systemmessage`/`error` envelope without the caller re-deriving it.

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, AppError>;

/// A closed taxonomy of failure kinds. The wire layer and lifecycle
/// controller branch on the variant, not on its message, to decide whether
/// a connection stays open, a write is deferred, or the process exits.
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing fields, out-of-range offsets, malformed intents.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Non-member edits, non-owner snapshot/sync requests.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Document deleted, chunk absent, channel unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate channel or document name under the same parent.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The durable store or hot tier is unreachable; the caller should
    /// degrade rather than fail outright.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// A malformed envelope or an event sent in an invalid session state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An unrecoverable condition encountered during startup.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    /// True for kinds the wire layer renders as `systemmessage` (connection
    /// stays open, no mutation performed).
    pub fn is_system_message(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_)
                | AppError::Authorization(_)
                | AppError::NotFound(_)
                | AppError::Conflict(_)
        )
    }

    /// True for kinds the wire layer renders as the `error{originalEvent,
    /// message}` diagnostic envelope.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, AppError::Protocol(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound(err.to_string()),
            other => AppError::TransientExternal(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::TransientExternal(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AppError::Authorization(err.to_string())
    }
}
