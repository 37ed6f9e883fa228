use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid {kind} key: {reason}")]
    InvalidKey { kind: &'static str, reason: String },
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("too many failed attempts, retry after {retry_after_seconds}s")]
    LockedOut { retry_after_seconds: u64 },
    #[error("usage store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("date format error: {0}")]
    DateFormat(#[from] time::error::Format),
    #[error("amount {0} exceeds the storable range")]
    AmountOutOfRange(u64),
}

#[derive(Debug, Error)]
pub enum CacheBackendError {
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
