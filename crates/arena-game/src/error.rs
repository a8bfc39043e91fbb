//! Game-layer error types.
//!
//! Every public API in this crate returns [`GameError`]. The variants
//! mirror how a caller must react: `NotFound` and `PreconditionFailed` are
//! terminal, `Conflict` means "re-read and resubmit", and store failures
//! may be retried with backoff.

use arena_store::StoreError;

/// Unified error type for game and user operations.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// The record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The record changed between read and guarded write.
    #[error("{entity} {id} was modified concurrently; re-read and retry")]
    Conflict { entity: &'static str, id: String },

    /// A business rule rejected the change. No write was attempted.
    #[error("precondition failed: {0}")]
    PreconditionFailed(#[from] Precondition),

    /// A live view could not be produced.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The business rule a rejected change broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("game over")]
    GameOver,
    #[error("not a player in this game")]
    NotAPlayer,
    #[error("already moved")]
    AlreadyMoved,
    #[error("cannot start a game against yourself")]
    SelfGame,
    #[error("invalid choice: {0}")]
    InvalidChoice(String),
    #[error("{entity} id cannot change from {from} to {to}")]
    IdChanged {
        entity: &'static str,
        from: String,
        to: String,
    },
}

/// Convenience alias used throughout this crate.
pub type GameResult<T> = std::result::Result<T, GameError>;

impl GameError {
    /// Whether resubmitting the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// The HTTP status a thin web layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::PreconditionFailed(Precondition::NotAPlayer) => 403,
            Self::PreconditionFailed(_) => 400,
            Self::Store(StoreError::InvalidKey(_) | StoreError::InvalidArgument(_)) => 400,
            Self::SubscriptionFailed(_) | Self::Store(_) => 503,
        }
    }
}
