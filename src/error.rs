//! Error taxonomy for the knowledge-store core.
//!
//! Every failure the core can produce is one of these variants, so callers
//! can decide between retry, reset, or accepting an empty answer without
//! inspecting message text. Configuration and CLI code use `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Network or disk failure during a transfer. Retry by starting the
    /// download again; the staged bytes are kept for resumption.
    #[error("transport error: {0}")]
    Transport(String),
    /// The artifact on disk is corrupt or incomplete. Needs a re-download.
    #[error("artifact validation failed: {0}")]
    Validation(String),
    /// The store was used before the lifecycle reached `Ready`.
    #[error("knowledge store is not ready: {0}")]
    NotReady(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// Both the index and the full scan failed.
    #[error("search failed: {0}")]
    Search(String),
    #[error("a download is already in progress")]
    AlreadyInProgress,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Transport(err.to_string())
    }

    pub fn search<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Search(err.to_string())
    }

    /// Whether re-invoking the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::Embedding(EmbeddingError::Timeout)
        )
    }
}

/// Failure of a single embedding request. Never affects other requests.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("no embedding backend is registered")]
    NotReady,
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("embedding queue is full")]
    QueueFull,
    #[error("embedding backend failed: {0}")]
    Backend(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding worker stopped")]
    Closed,
}

impl EmbeddingError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        EmbeddingError::Backend(err.to_string())
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
