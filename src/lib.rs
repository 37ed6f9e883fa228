pub mod cache;
pub mod clock;
pub mod config;
mod error;
pub mod guard;
pub mod keys;
pub mod limits;
pub mod lockout;
pub mod metered;
pub mod observability;
pub mod quota;
pub mod reclaimer;
pub mod shards;
pub mod store;

pub use cache::{CacheBackend, CacheLayer, CacheLookup, MemoryCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, GuardConfig, LockoutConfig, QuotaConfig, ReclaimerConfig, RequestLimitConfig,
    StoreConfig, StoreOutagePolicy,
};
pub use error::{CacheBackendError, ConfigError, GuardError, StoreError};
pub use guard::{GuardParts, QuotaGuard};
pub use keys::{AccountKey, ClientKey};
pub use limits::{Decision, RequestLimiter};
pub use lockout::LockoutLimiter;
pub use metered::{DegradeReason, MeteredOutcome, MeteredOutput, MeteredRunner};
pub use observability::{GuardStats, GuardStatsSnapshot, init_tracing};
pub use quota::{MeterState, QuotaEngine, QuotaStatus, StatusPayload};
pub use reclaimer::{ReclaimReport, Reclaimer, ReclaimerHandle};
pub use store::{Meter, MemoryUsageStore, UsageRecord, UsageStore};

#[cfg(feature = "store-redis")]
pub use cache::RedisCacheBackend;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteUsageStore;
