//! Error types for TagStream

/// Result type alias using TagStream's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for TagStream operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing input
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation conflicts with existing state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resource is not ready yet; the caller may retry
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(String),

    /// On-disk schema does not match this build
    #[error(
        "store schema version {found} does not match classifier version {expected}; \
         run the store migration before starting"
    )]
    SchemaMismatch { found: u32, expected: u32 },

    /// Store location cannot be opened
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Fetching a remote document failed
    #[error("network error: {0}")]
    Network(String),

    /// Work was cancelled before it finished
    #[error("cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new store-unavailable error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
