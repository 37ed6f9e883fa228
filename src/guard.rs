//! `QuotaGuard` wires the limiters, the quota engine and the cache layer
//! behind one handle that request and auth handlers share.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cache::{CacheBackend, CacheLayer, MemoryCacheBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, GuardConfig, StoreConfig};
use crate::error::GuardError;
use crate::keys::{AccountKey, ClientKey};
use crate::limits::{Decision, RequestLimiter};
use crate::lockout::LockoutLimiter;
use crate::metered::{DegradeReason, MeteredOutcome, MeteredOutput, MeteredRunner};
use crate::observability::{GuardStats, GuardStatsSnapshot};
use crate::quota::{QuotaEngine, QuotaStatus, StatusPayload};
use crate::reclaimer::{Reclaimer, ReclaimerHandle};
use crate::store::{Meter, MemoryUsageStore, UsageStore};

/// Externally supplied collaborators.
pub struct GuardParts {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn UsageStore>,
    pub cache_backend: Arc<dyn CacheBackend>,
}

impl GuardParts {
    /// Process-local store and cache on the given clock.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(MemoryUsageStore::new()),
            cache_backend: Arc::new(MemoryCacheBackend::new(clock.clone())),
            clock,
        }
    }
}

pub struct QuotaGuard {
    config: GuardConfig,
    requests: Arc<RequestLimiter>,
    lockout: Arc<LockoutLimiter>,
    cache: Arc<CacheLayer>,
    quota: Arc<QuotaEngine>,
    metered: MeteredRunner,
    stats: Arc<GuardStats>,
}

impl QuotaGuard {
    /// Builds a guard on the system clock, opening the configured SQLite
    /// database and redis cache. Without them, state stays in memory.
    pub async fn from_config(config: GuardConfig) -> Result<Self, GuardError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = open_store(&config.store).await?;
        let cache_backend = open_cache_backend(&config.cache, clock.clone())?;
        Ok(Self::with_parts(
            config,
            GuardParts {
                clock,
                store,
                cache_backend,
            },
        ))
    }

    pub fn with_parts(config: GuardConfig, parts: GuardParts) -> Self {
        let GuardParts {
            clock,
            store,
            cache_backend,
        } = parts;
        let stats = Arc::new(GuardStats::default());

        let requests = Arc::new(RequestLimiter::new(&config.requests, clock.clone()));
        let lockout = Arc::new(LockoutLimiter::new(&config.lockout, clock.clone()));
        let cache = Arc::new(
            CacheLayer::new(cache_backend, config.cache.clone()).with_stats(stats.clone()),
        );
        let quota = Arc::new(
            QuotaEngine::new(
                store,
                cache.clone(),
                clock,
                config.quota.clone(),
                config.store.timeout(),
            )
            .with_stats(stats.clone()),
        );
        let metered = MeteredRunner::new(quota.clone(), cache.clone(), stats.clone());

        Self {
            config,
            requests,
            lockout,
            cache,
            quota,
            metered,
            stats,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn admit(&self, client: &ClientKey) -> Decision {
        let decision = self.requests.admit(client);
        self.stats.record_request(decision.allowed);
        decision
    }

    /// Gate for a login attempt. Call before checking credentials.
    pub fn check_login(&self, account: &AccountKey) -> Decision {
        let decision = self.lockout.is_allowed(account);
        if !decision.allowed {
            self.stats.record_login_refused();
        }
        decision
    }

    pub fn record_login_failure(&self, account: &AccountKey) {
        self.lockout.record_failure(account);
    }

    pub fn record_login_success(&self, account: &AccountKey) {
        self.lockout.clear(account);
    }

    pub async fn check_limits(&self, account: &AccountKey) -> Result<QuotaStatus, GuardError> {
        self.quota.check_limits(account).await
    }

    pub async fn status(&self, account: &AccountKey) -> Result<StatusPayload, GuardError> {
        self.quota.status_payload(account).await
    }

    pub async fn record_usage(
        &self,
        account: &AccountKey,
        meter: Meter,
        amount: u64,
    ) -> Result<(), GuardError> {
        self.quota.increment(account, meter, amount).await
    }

    pub async fn run_metered<T, E, F, Fut, D>(
        &self,
        account: &AccountKey,
        meter: Meter,
        call: F,
        fallback: D,
    ) -> Result<MeteredOutcome<T>, GuardError>
    where
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MeteredOutput<T>, E>>,
        D: FnOnce(DegradeReason) -> T,
    {
        self.metered.run(account, meter, call, fallback).await
    }

    pub async fn run_metered_cached<A, T, E, F, Fut, D>(
        &self,
        operation: &str,
        args: &A,
        account: &AccountKey,
        meter: Meter,
        call: F,
        fallback: D,
    ) -> Result<MeteredOutcome<T>, GuardError>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MeteredOutput<T>, E>>,
        D: FnOnce(DegradeReason) -> T,
    {
        self.metered
            .run_cached(operation, args, account, meter, call, fallback)
            .await
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn quota(&self) -> &QuotaEngine {
        &self.quota
    }

    pub fn requests(&self) -> &RequestLimiter {
        &self.requests
    }

    pub fn lockout(&self) -> &LockoutLimiter {
        &self.lockout
    }

    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(self.requests.clone(), self.lockout.clone())
    }

    /// Starts the periodic sweep unless it is disabled in config. Must be
    /// called from within a tokio runtime.
    pub fn spawn_reclaimer(&self) -> Option<ReclaimerHandle> {
        if !self.config.reclaimer.enabled {
            return None;
        }
        Some(self.reclaimer().spawn(self.config.reclaimer.period()))
    }

    pub fn stats(&self) -> GuardStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("requests", &self.requests)
            .field("lockout", &self.lockout)
            .field("cache", &self.cache)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn UsageStore>, GuardError> {
    match &config.sqlite_path {
        #[cfg(feature = "store-sqlite")]
        Some(path) => {
            let store =
                crate::store::SqliteUsageStore::new(path).with_timeout(config.timeout());
            store.init().await?;
            tracing::info!(path = %path.display(), "usage store opened");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-sqlite"))]
        Some(_) => Err(crate::error::ConfigError::Invalid(
            "store.sqlite_path is set but the store-sqlite feature is disabled".to_string(),
        )
        .into()),
        None => {
            tracing::warn!("no store.sqlite_path configured, usage counters are kept in memory");
            Ok(Arc::new(MemoryUsageStore::new()))
        }
    }
}

fn open_cache_backend(
    config: &CacheConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CacheBackend>, GuardError> {
    match &config.redis_url {
        #[cfg(feature = "store-redis")]
        Some(url) => {
            let backend = crate::cache::RedisCacheBackend::new(url)
                .map_err(|err| crate::error::ConfigError::Invalid(format!("cache.redis_url: {err}")))?
                .with_prefix(config.redis_prefix.clone());
            tracing::info!(prefix = %config.redis_prefix, "redis cache configured");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "store-redis"))]
        Some(_) => Err(crate::error::ConfigError::Invalid(
            "cache.redis_url is set but the store-redis feature is disabled".to_string(),
        )
        .into()),
        None => Ok(Arc::new(MemoryCacheBackend::new(clock))),
    }
}
