//! Configuration for every component, loadable from TOML.
//!
//! Every section is optional in the file; missing values fall back to the
//! defaults below.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{NEWS_LOOKUP_OPERATION, QUOTA_STATUS_OPERATION};
use crate::error::ConfigError;
use crate::shards::DEFAULT_SHARDS;

pub const DEFAULT_REQUEST_WINDOW_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_REQUESTS: u32 = 10;
pub const DEFAULT_LOCKOUT_WINDOW_SECS: u64 = 15 * 60;
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_GENERATION_TOKENS_DAILY_LIMIT: u64 = 100_000;
pub const DEFAULT_NEWS_LOOKUPS_DAILY_LIMIT: u64 = 95;
pub const DEFAULT_WARNING_THRESHOLD_PERCENT: u8 = 80;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_NEWS_LOOKUP_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_QUOTA_STATUS_TTL_SECS: u64 = 60;
pub const DEFAULT_CACHE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RECLAIM_PERIOD_SECS: u64 = 60 * 60;

const ENV_SQLITE_PATH: &str = "OUTREACH_QUOTA_SQLITE_PATH";
const ENV_REDIS_URL: &str = "OUTREACH_QUOTA_REDIS_URL";
const ENV_REDIS_PREFIX: &str = "OUTREACH_QUOTA_REDIS_PREFIX";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub requests: RequestLimitConfig,
    pub lockout: LockoutConfig,
    pub quota: QuotaConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub reclaimer: ReclaimerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
    pub shards: usize,
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_REQUEST_WINDOW_SECS,
            max_requests: DEFAULT_MAX_REQUESTS,
            shards: DEFAULT_SHARDS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    pub window_secs: u64,
    pub max_attempts: u32,
    pub shards: usize,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_LOCKOUT_WINDOW_SECS,
            max_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// What `check_limits` does when the usage store cannot be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutagePolicy {
    /// Surface the store error to the caller.
    #[default]
    FailClosed,
    /// Report zero usage, flagged as degraded.
    FailOpen,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub generation_tokens_daily_limit: u64,
    pub news_lookups_daily_limit: u64,
    pub warning_threshold_percent: u8,
    pub store_outage_policy: StoreOutagePolicy,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            generation_tokens_daily_limit: DEFAULT_GENERATION_TOKENS_DAILY_LIMIT,
            news_lookups_daily_limit: DEFAULT_NEWS_LOOKUPS_DAILY_LIMIT,
            warning_threshold_percent: DEFAULT_WARNING_THRESHOLD_PERCENT,
            store_outage_policy: StoreOutagePolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub default_ttl_secs: u64,
    /// Per-operation TTL overrides, keyed by operation name.
    pub ttl_secs: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut ttl_secs = BTreeMap::new();
        ttl_secs.insert(
            NEWS_LOOKUP_OPERATION.to_string(),
            DEFAULT_NEWS_LOOKUP_TTL_SECS,
        );
        ttl_secs.insert(
            QUOTA_STATUS_OPERATION.to_string(),
            DEFAULT_QUOTA_STATUS_TTL_SECS,
        );
        Self {
            enabled: true,
            timeout_ms: DEFAULT_CACHE_TIMEOUT_MS,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            ttl_secs,
            redis_url: None,
            redis_prefix: "outreach".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, operation: &str) -> Duration {
        let secs = self
            .ttl_secs
            .get(operation)
            .copied()
            .or_else(|| builtin_ttl_secs(operation))
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub enabled: bool,
    pub period_secs: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: DEFAULT_RECLAIM_PERIOD_SECS,
        }
    }
}

impl ReclaimerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl GuardConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Applies deploy-time overrides from `OUTREACH_QUOTA_*` variables.
    pub fn apply_env(&mut self) {
        if let Some(path) = env_nonempty(ENV_SQLITE_PATH) {
            self.store.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_nonempty(ENV_REDIS_URL) {
            self.cache.redis_url = Some(url);
        }
        if let Some(prefix) = env_nonempty(ENV_REDIS_PREFIX) {
            self.cache.redis_prefix = prefix;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.requests.window_secs == 0 || self.requests.max_requests == 0 {
            return invalid("requests.window_secs and requests.max_requests must be > 0");
        }
        if self.lockout.window_secs == 0 || self.lockout.max_attempts == 0 {
            return invalid("lockout.window_secs and lockout.max_attempts must be > 0");
        }
        if self.quota.generation_tokens_daily_limit == 0 || self.quota.news_lookups_daily_limit == 0
        {
            return invalid("quota daily limits must be > 0");
        }
        if !(1..=100).contains(&self.quota.warning_threshold_percent) {
            return invalid("quota.warning_threshold_percent must be within 1..=100");
        }
        if self.cache.timeout_ms == 0 || self.store.timeout_ms == 0 {
            return invalid("cache.timeout_ms and store.timeout_ms must be > 0");
        }
        if self.reclaimer.enabled && self.reclaimer.period_secs == 0 {
            return invalid("reclaimer.period_secs must be > 0");
        }
        Ok(())
    }
}

fn builtin_ttl_secs(operation: &str) -> Option<u64> {
    match operation {
        NEWS_LOOKUP_OPERATION => Some(DEFAULT_NEWS_LOOKUP_TTL_SECS),
        QUOTA_STATUS_OPERATION => Some(DEFAULT_QUOTA_STATUS_TTL_SECS),
        _ => None,
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
