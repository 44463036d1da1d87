//! Error types for the Quill ecosystem.

use thiserror::Error;

/// Result type alias using the Quill error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Quill components.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend could not be reached (connection refused, DNS, TLS)
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// No response or stream event within the configured deadline
    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    /// Backend returned something the client could not interpret
    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    /// Caller-initiated cancellation
    #[error("Cancelled")]
    Cancelled,

    /// An exchange is already in progress on this engine
    #[error("An exchange is already in progress")]
    Busy,

    /// Still over budget after summarization and truncation
    #[error("Context budget exceeded beyond recovery: {0}")]
    BudgetExceeded(String),

    /// Stale revision detected on save (lost-update race)
    #[error("Session revision conflict: {0}")]
    Conflict(String),

    /// Encrypted record could not be decrypted (wrong or missing key)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Session or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Repository IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check whether the failed operation is worth retrying as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable(_) | Self::BackendTimeout(_) | Self::Conflict(_)
        )
    }

    /// Check if this is a revision conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a caller-initiated cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
