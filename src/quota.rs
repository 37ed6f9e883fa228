//! Daily quota enforcement for the two metered services.
//!
//! Usage is read through the cache-aside layer under the `quota_status`
//! operation, keyed by account and UTC date. Every increment invalidates that
//! entry so a status read right after a write sees the new total.
//!
//! A read that loaded the row before an increment committed may store its
//! value after the increment's invalidation. Each `(account, date)` hashes to
//! a write generation that increments bump before invalidating; a read that
//! sees the generation move while it was loading drops its own entry.

use std::future::Future;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::cache::{CacheLayer, QUOTA_STATUS_OPERATION};
use crate::clock::Clock;
use crate::config::{QuotaConfig, StoreOutagePolicy};
use crate::error::{GuardError, StoreError};
use crate::keys::AccountKey;
use crate::observability::GuardStats;
use crate::store::{Meter, UsageRecord, UsageStore};

/// Position of one meter on its daily cap. Moves forward only within a day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterState {
    Unmetered,
    UnderWarningThreshold,
    OverWarningThreshold,
    LimitReached,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub account: AccountKey,
    pub date: Date,
    pub generation_tokens_used: u64,
    pub generation_tokens_limit: u64,
    pub news_lookups_used: u64,
    pub news_lookups_limit: u64,
    pub generation_tokens_limit_reached: bool,
    pub news_lookups_limit_reached: bool,
    /// Meters at or above the warning threshold. Advisory only.
    pub warnings: Vec<Meter>,
    /// Set when usage could not be read and zero was assumed.
    pub degraded: bool,
}

impl QuotaStatus {
    fn from_record(record: UsageRecord, config: &QuotaConfig, degraded: bool) -> Self {
        let mut status = Self {
            generation_tokens_used: record.generation_tokens,
            generation_tokens_limit: config.generation_tokens_daily_limit,
            news_lookups_used: record.news_lookups,
            news_lookups_limit: config.news_lookups_daily_limit,
            generation_tokens_limit_reached: false,
            news_lookups_limit_reached: false,
            warnings: Vec::new(),
            degraded,
            account: record.account,
            date: record.date,
        };
        status.generation_tokens_limit_reached =
            status.state_with(Meter::GenerationTokens, 100) == MeterState::LimitReached;
        status.news_lookups_limit_reached =
            status.state_with(Meter::NewsLookups, 100) == MeterState::LimitReached;
        status.warnings = Meter::ALL
            .into_iter()
            .filter(|meter| {
                status.state_with(*meter, config.warning_threshold_percent)
                    >= MeterState::OverWarningThreshold
            })
            .collect();
        status
    }

    pub fn used(&self, meter: Meter) -> u64 {
        match meter {
            Meter::GenerationTokens => self.generation_tokens_used,
            Meter::NewsLookups => self.news_lookups_used,
        }
    }

    pub fn limit(&self, meter: Meter) -> u64 {
        match meter {
            Meter::GenerationTokens => self.generation_tokens_limit,
            Meter::NewsLookups => self.news_lookups_limit,
        }
    }

    pub fn limit_reached(&self, meter: Meter) -> bool {
        match meter {
            Meter::GenerationTokens => self.generation_tokens_limit_reached,
            Meter::NewsLookups => self.news_lookups_limit_reached,
        }
    }

    pub fn is_warning(&self, meter: Meter) -> bool {
        self.warnings.contains(&meter)
    }

    pub fn state(&self, meter: Meter) -> MeterState {
        if self.limit_reached(meter) {
            MeterState::LimitReached
        } else if self.is_warning(meter) {
            MeterState::OverWarningThreshold
        } else if self.used(meter) == 0 {
            MeterState::Unmetered
        } else {
            MeterState::UnderWarningThreshold
        }
    }

    fn state_with(&self, meter: Meter, threshold_percent: u8) -> MeterState {
        let used = self.used(meter);
        let limit = self.limit(meter);
        if used >= limit {
            return MeterState::LimitReached;
        }
        let used_scaled = u128::from(used) * 100;
        let threshold_scaled = u128::from(limit) * u128::from(threshold_percent);
        if used_scaled >= threshold_scaled {
            MeterState::OverWarningThreshold
        } else if used == 0 {
            MeterState::Unmetered
        } else {
            MeterState::UnderWarningThreshold
        }
    }

    pub fn payload(&self) -> StatusPayload {
        StatusPayload {
            generation_tokens_used: self.generation_tokens_used,
            generation_tokens_limit: self.generation_tokens_limit,
            news_lookups_used: self.news_lookups_used,
            news_lookups_limit: self.news_lookups_limit,
            within_limits: self.generation_tokens_used < self.generation_tokens_limit
                && self.news_lookups_used < self.news_lookups_limit,
        }
    }
}

/// Read-only body of the usage status endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub generation_tokens_used: u64,
    pub generation_tokens_limit: u64,
    pub news_lookups_used: u64,
    pub news_lookups_limit: u64,
    pub within_limits: bool,
}

const WRITE_GENERATION_STRIPES: usize = 64;

pub struct QuotaEngine {
    store: Arc<dyn UsageStore>,
    cache: Arc<CacheLayer>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    store_timeout: Duration,
    stats: Arc<GuardStats>,
    write_generations: Box<[AtomicU64]>,
    hasher: RandomState,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn UsageStore>,
        cache: Arc<CacheLayer>,
        clock: Arc<dyn Clock>,
        config: QuotaConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
            store_timeout,
            stats: Arc::new(GuardStats::default()),
            write_generations: (0..WRITE_GENERATION_STRIPES)
                .map(|_| AtomicU64::new(0))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn with_stats(mut self, stats: Arc<GuardStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn limit(&self, meter: Meter) -> u64 {
        match meter {
            Meter::GenerationTokens => self.config.generation_tokens_daily_limit,
            Meter::NewsLookups => self.config.news_lookups_daily_limit,
        }
    }

    /// Today's usage for `account`, creating a zero row on the first check of
    /// the day.
    pub async fn check_limits(&self, account: &AccountKey) -> Result<QuotaStatus, GuardError> {
        let date = self.clock.today();
        let ttl = self.cache.ttl_for(QUOTA_STATUS_OPERATION);
        let generation = self.write_generation(account, date);
        let before = generation.load(Ordering::Acquire);
        let loaded: Result<UsageRecord, StoreError> = self
            .cache
            .with_cache(QUOTA_STATUS_OPERATION, &(account, date), ttl, || {
                self.bounded(self.store.ensure(account, date))
            })
            .await;
        if generation.load(Ordering::Acquire) != before {
            tracing::debug!(account = %account, "usage changed during status read, dropping cached status");
            self.cache
                .invalidate(QUOTA_STATUS_OPERATION, &(account, date))
                .await;
        }

        let status = match loaded {
            Ok(record) => QuotaStatus::from_record(record, &self.config, false),
            Err(err) => match self.config.store_outage_policy {
                StoreOutagePolicy::FailClosed => {
                    tracing::error!(account = %account, error = %err, "quota check failed, usage store unavailable");
                    return Err(err.into());
                }
                StoreOutagePolicy::FailOpen => {
                    tracing::warn!(account = %account, error = %err, "usage store unavailable, assuming zero usage");
                    QuotaStatus::from_record(
                        UsageRecord::zero(account.clone(), date),
                        &self.config,
                        true,
                    )
                }
            },
        };

        for meter in Meter::ALL {
            if status.limit_reached(meter) {
                tracing::info!(account = %account, meter = %meter, used = status.used(meter), "daily limit reached");
            } else if status.is_warning(meter) {
                tracing::info!(account = %account, meter = %meter, used = status.used(meter), "daily usage above warning threshold");
            }
        }
        Ok(status)
    }

    pub async fn status_payload(&self, account: &AccountKey) -> Result<StatusPayload, GuardError> {
        Ok(self.check_limits(account).await?.payload())
    }

    /// Adds `amount` to today's counter. A store failure is returned as an
    /// error; usage is never dropped silently.
    pub async fn increment(
        &self,
        account: &AccountKey,
        meter: Meter,
        amount: u64,
    ) -> Result<(), GuardError> {
        if amount == 0 {
            return Ok(());
        }
        let date = self.clock.today();
        if let Err(err) = self
            .bounded(self.store.increment(account, date, meter, amount))
            .await
        {
            tracing::error!(account = %account, meter = %meter, amount, error = %err, "failed to record usage");
            return Err(err.into());
        }
        self.stats.record_usage();
        tracing::debug!(account = %account, meter = %meter, amount, "usage recorded");

        self.write_generation(account, date)
            .fetch_add(1, Ordering::AcqRel);
        self.cache
            .invalidate(QUOTA_STATUS_OPERATION, &(account, date))
            .await;
        Ok(())
    }

    pub async fn increment_generation_tokens(
        &self,
        account: &AccountKey,
        tokens: u64,
    ) -> Result<(), GuardError> {
        self.increment(account, Meter::GenerationTokens, tokens).await
    }

    pub async fn increment_news_lookups(
        &self,
        account: &AccountKey,
        calls: u64,
    ) -> Result<(), GuardError> {
        self.increment(account, Meter::NewsLookups, calls).await
    }

    /// Reads a stored row without creating it and without the cache.
    pub async fn read(
        &self,
        account: &AccountKey,
        date: Date,
    ) -> Result<Option<UsageRecord>, GuardError> {
        Ok(self.bounded(self.store.read(account, date)).await?)
    }

    pub async fn usage_for_date(&self, date: Date) -> Result<Vec<UsageRecord>, GuardError> {
        Ok(self.bounded(self.store.list_for_date(date)).await?)
    }

    fn write_generation(&self, account: &AccountKey, date: Date) -> &AtomicU64 {
        let index = (self.hasher.hash_one((account.as_str(), date)) as usize)
            % self.write_generations.len();
        &self.write_generations[index]
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                timeout_ms: u64::try_from(self.store_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl std::fmt::Debug for QuotaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("config", &self.config)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::store::MemoryUsageStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    const DAY: u64 = 86_400;

    struct DownStore;

    #[async_trait]
    impl UsageStore for DownStore {
        async fn increment(&self, _: &AccountKey, _: Date, _: Meter, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn read(&self, _: &AccountKey, _: Date) -> Result<Option<UsageRecord>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn ensure(&self, _: &AccountKey, _: Date) -> Result<UsageRecord, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn list_for_date(&self, _: Date) -> Result<Vec<UsageRecord>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    /// Holds the next `ensure` after it has read the row until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryUsageStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl UsageStore for GatedStore {
        async fn increment(
            &self,
            account: &AccountKey,
            date: Date,
            meter: Meter,
            amount: u64,
        ) -> Result<(), StoreError> {
            self.inner.increment(account, date, meter, amount).await
        }

        async fn read(&self, account: &AccountKey, date: Date) -> Result<Option<UsageRecord>, StoreError> {
            self.inner.read(account, date).await
        }

        async fn ensure(&self, account: &AccountKey, date: Date) -> Result<UsageRecord, StoreError> {
            let record = self.inner.ensure(account, date).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(record)
        }

        async fn list_for_date(&self, date: Date) -> Result<Vec<UsageRecord>, StoreError> {
            self.inner.list_for_date(date).await
        }
    }

    fn engine_with(
        store: Arc<dyn UsageStore>,
        config: QuotaConfig,
    ) -> (Arc<ManualClock>, QuotaEngine) {
        let clock = Arc::new(ManualClock::new(20_000 * DAY));
        let backend = Arc::new(MemoryCacheBackend::new(clock.clone()));
        let cache = Arc::new(CacheLayer::new(backend, CacheConfig::default()));
        let engine = QuotaEngine::new(store, cache, clock.clone(), config, Duration::from_secs(1));
        (clock, engine)
    }

    fn account() -> AccountKey {
        AccountKey::parse("user@example.com").unwrap()
    }

    #[tokio::test]
    async fn first_check_creates_zero_row() {
        let store = Arc::new(MemoryUsageStore::new());
        let (clock, engine) = engine_with(store.clone(), QuotaConfig::default());

        let status = engine.check_limits(&account()).await.unwrap();
        assert_eq!(status.generation_tokens_used, 0);
        assert_eq!(status.news_lookups_used, 0);
        assert!(!status.generation_tokens_limit_reached);
        assert!(!status.news_lookups_limit_reached);
        assert!(status.warnings.is_empty());
        assert_eq!(status.state(Meter::NewsLookups), MeterState::Unmetered);

        let row = store.read(&account(), clock.today()).await.unwrap();
        assert_eq!(row, Some(UsageRecord::zero(account(), clock.today())));
    }

    #[tokio::test]
    async fn states_advance_with_usage() {
        let store = Arc::new(MemoryUsageStore::new());
        let (_clock, engine) = engine_with(store, QuotaConfig::default());
        let acct = account();

        engine.increment_news_lookups(&acct, 10).await.unwrap();
        let status = engine.check_limits(&acct).await.unwrap();
        assert_eq!(status.state(Meter::NewsLookups), MeterState::UnderWarningThreshold);

        // 76 of 95 is exactly 80%.
        engine.increment_news_lookups(&acct, 66).await.unwrap();
        let status = engine.check_limits(&acct).await.unwrap();
        assert_eq!(status.state(Meter::NewsLookups), MeterState::OverWarningThreshold);
        assert_eq!(status.warnings, vec![Meter::NewsLookups]);
        assert!(status.payload().within_limits);

        engine.increment_news_lookups(&acct, 19).await.unwrap();
        let status = engine.check_limits(&acct).await.unwrap();
        assert!(status.news_lookups_limit_reached);
        assert!(!status.generation_tokens_limit_reached);
        assert_eq!(status.state(Meter::NewsLookups), MeterState::LimitReached);
        assert_eq!(status.state(Meter::GenerationTokens), MeterState::Unmetered);
        assert!(!status.payload().within_limits);
    }

    #[tokio::test]
    async fn increment_invalidates_cached_status() {
        let store = Arc::new(MemoryUsageStore::new());
        let (_clock, engine) = engine_with(store, QuotaConfig::default());
        let acct = account();

        assert_eq!(engine.check_limits(&acct).await.unwrap().generation_tokens_used, 0);
        engine.increment_generation_tokens(&acct, 1_234).await.unwrap();
        assert_eq!(
            engine.check_limits(&acct).await.unwrap().generation_tokens_used,
            1_234
        );
    }

    #[tokio::test]
    async fn status_read_racing_an_increment_does_not_cache_the_old_total() {
        let store = Arc::new(GatedStore::default());
        let (_clock, engine) = engine_with(store.clone(), QuotaConfig::default());
        let engine = Arc::new(engine);
        let acct = account();

        engine.increment_news_lookups(&acct, 94).await.unwrap();
        store.armed.store(true, Ordering::SeqCst);
        let reader = tokio::spawn({
            let engine = engine.clone();
            let acct = acct.clone();
            async move { engine.check_limits(&acct).await }
        });
        store.entered.notified().await;

        engine.increment_news_lookups(&acct, 1).await.unwrap();
        store.release.notify_one();
        let in_flight = reader.await.unwrap().unwrap();
        assert_eq!(in_flight.news_lookups_used, 94);

        let status = engine.check_limits(&acct).await.unwrap();
        assert_eq!(status.news_lookups_used, 95);
        assert!(status.news_lookups_limit_reached);
    }

    #[tokio::test]
    async fn limit_resets_at_day_rollover() {
        let store = Arc::new(MemoryUsageStore::new());
        let (clock, engine) = engine_with(store, QuotaConfig::default());
        let acct = account();

        engine.increment_news_lookups(&acct, 95).await.unwrap();
        assert!(engine.check_limits(&acct).await.unwrap().news_lookups_limit_reached);

        clock.advance(Duration::from_secs(DAY));
        let status = engine.check_limits(&acct).await.unwrap();
        assert!(!status.news_lookups_limit_reached);
        assert_eq!(status.news_lookups_used, 0);
    }

    #[tokio::test]
    async fn store_outage_fails_closed_by_default() {
        let (_clock, engine) = engine_with(Arc::new(DownStore), QuotaConfig::default());
        let err = engine.check_limits(&account()).await.unwrap_err();
        assert!(matches!(err, GuardError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn store_outage_can_fail_open() {
        let config = QuotaConfig {
            store_outage_policy: StoreOutagePolicy::FailOpen,
            ..QuotaConfig::default()
        };
        let (_clock, engine) = engine_with(Arc::new(DownStore), config);

        let status = engine.check_limits(&account()).await.unwrap();
        assert!(status.degraded);
        assert_eq!(status.news_lookups_used, 0);
        assert!(!status.news_lookups_limit_reached);
    }

    #[tokio::test]
    async fn increments_always_fail_closed() {
        let config = QuotaConfig {
            store_outage_policy: StoreOutagePolicy::FailOpen,
            ..QuotaConfig::default()
        };
        let (_clock, engine) = engine_with(Arc::new(DownStore), config);
        let err = engine
            .increment_generation_tokens(&account(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Store(_)));
    }
}
