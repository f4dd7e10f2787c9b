use thiserror::Error;

/// Raw failure reported by a chain data source, classified before any retry
/// policy is applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The provider reported "too many requests".
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Any other network or provider failure.
    #[error("{0}")]
    Other(String),
}

/// Failure of a single fetch after the retry policy ran.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Still rate limited after exhausting retries; skip this item.
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    /// Non-retryable network/provider error; skip this item.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Configuration problems. Fatal at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown protocol id: {0}")]
    UnknownProtocol(String),

    #[error("duplicate protocol id: {0}")]
    DuplicateProtocol(String),

    #[error("protocol {protocol}: missing required field `{field}`")]
    MissingField { protocol: String, field: &'static str },

    #[error("protocol {protocol}: invalid value for `{field}`: {reason}")]
    InvalidValue {
        protocol: String,
        field: &'static str,
        reason: String,
    },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure of a whole indexer run. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("failed to fetch signatures: {0}")]
    Signatures(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
