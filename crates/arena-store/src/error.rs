//! Error types for the arena-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Expected outcomes are *not* errors: a missing key is `Ok(None)` and a
//! failed guard is `Ok(Commit::Conflict)`. This enum is reserved for
//! storage failures and invalid input.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite database failed (I/O, locking, corruption).
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    /// JSON serialization or deserialization of a value failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A key could not be encoded or decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// The store handle has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Whether the caller may reasonably retry the operation later.
    ///
    /// Only storage-level failures qualify; invalid input and a closed
    /// store will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::TaskJoin(_))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
