//! Cache-aside wrapper for expensive reads.
//!
//! [`CacheLayer::with_cache`] derives a key from an operation name plus a
//! canonical JSON encoding of the call's arguments, returns a cached value when
//! one is present, and otherwise runs the wrapped call and stores its `Ok`
//! result. An `Err` from the wrapped call is returned untouched and never
//! cached.
//!
//! The layer fails open: when the backend errors or exceeds its timeout the
//! call runs uncached and the caller never sees the cache failure.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Digest as _;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::CacheBackendError;
use crate::observability::GuardStats;

#[cfg(feature = "store-redis")]
pub mod redis;

#[cfg(feature = "store-redis")]
pub use self::redis::RedisCacheBackend;

pub const NEWS_LOOKUP_OPERATION: &str = "news_lookup";
pub const QUOTA_STATUS_OPERATION: &str = "quota_status";

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheBackendError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration)
    -> Result<(), CacheBackendError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError>;
}

/// Result of a cache read, keeping "not cached" apart from "cache broken".
#[derive(Debug)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
    BackendError(CacheBackendError),
}

pub struct CacheLayer {
    backend: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
    stats: Arc<GuardStats>,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let backend = config.enabled.then_some(backend);
        Self {
            backend,
            config,
            stats: Arc::new(GuardStats::default()),
        }
    }

    /// A layer that always runs the wrapped call.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            config: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            stats: Arc::new(GuardStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<GuardStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.config.ttl_for(operation)
    }

    /// Deterministic key for `operation` called with `args`.
    ///
    /// Arguments are encoded through `serde_json::Value`, whose maps are
    /// ordered, so equal arguments always produce equal keys.
    pub fn cache_key<A>(operation: &str, args: &A) -> Result<String, CacheBackendError>
    where
        A: Serialize + ?Sized,
    {
        let canonical = serde_json::to_vec(&serde_json::to_value(args)?)?;
        let digest = sha2::Sha256::digest(&canonical);
        Ok(format!("{operation}:{}", hex_lower(&digest)))
    }

    pub async fn lookup<T>(&self, key: &str) -> CacheLookup<T>
    where
        T: DeserializeOwned,
    {
        let Some(backend) = self.backend.as_ref() else {
            return CacheLookup::Miss;
        };
        let raw = match tokio::time::timeout(self.config.timeout(), backend.get(key)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => return CacheLookup::BackendError(err),
            Err(_) => {
                return CacheLookup::BackendError(CacheBackendError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                });
            }
        };
        let Some(raw) = raw else {
            return CacheLookup::Miss;
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => CacheLookup::Hit(value),
            Err(err) => {
                // An entry from an older value shape is as good as no entry.
                tracing::debug!(key, error = %err, "discarding undecodable cache entry");
                CacheLookup::Miss
            }
        }
    }

    pub async fn store<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheBackendError>
    where
        T: Serialize,
    {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(());
        };
        if ttl.is_zero() {
            return Ok(());
        }
        let payload = serde_json::to_vec(value)?;
        match tokio::time::timeout(self.config.timeout(), backend.set(key, payload, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(CacheBackendError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }),
        }
    }

    pub async fn with_cache<A, T, E, F, Fut>(
        &self,
        operation: &str,
        args: &A,
        ttl: Duration,
        f: F,
    ) -> Result<T, E>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.is_enabled() {
            return f().await;
        }
        let key = match Self::cache_key(operation, args) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(operation, error = %err, "cache key derivation failed, bypassing cache");
                return f().await;
            }
        };

        match self.lookup::<T>(&key).await {
            CacheLookup::Hit(value) => {
                self.stats.record_cache_hit();
                tracing::debug!(operation, "cache hit");
                return Ok(value);
            }
            CacheLookup::Miss => {
                self.stats.record_cache_miss();
            }
            CacheLookup::BackendError(err) => {
                self.stats.record_cache_backend_error();
                tracing::warn!(operation, error = %err, "cache lookup failed, bypassing cache");
                return f().await;
            }
        }

        let value = f().await?;
        if let Err(err) = self.store(&key, &value, ttl).await {
            self.stats.record_cache_backend_error();
            tracing::warn!(operation, error = %err, "cache store failed");
        }
        Ok(value)
    }

    /// Drops the cached entry for `operation` called with `args`. Failures are
    /// logged and reported as `false`.
    pub async fn invalidate<A>(&self, operation: &str, args: &A) -> bool
    where
        A: Serialize + ?Sized,
    {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        let key = match Self::cache_key(operation, args) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(operation, error = %err, "cache key derivation failed");
                return false;
            }
        };
        match tokio::time::timeout(self.config.timeout(), backend.delete(&key)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(err)) => {
                self.stats.record_cache_backend_error();
                tracing::warn!(operation, error = %err, "cache invalidation failed");
                false
            }
            Err(_) => {
                self.stats.record_cache_backend_error();
                tracing::warn!(operation, timeout_ms = self.config.timeout_ms, "cache invalidation timed out");
                false
            }
        }
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .finish()
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

pub const DEFAULT_MEMORY_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct MemoryEntries {
    entries: HashMap<String, MemoryEntry>,
    order: VecDeque<String>,
}

/// In-process backend with second-granularity expiry and FIFO eviction.
pub struct MemoryCacheBackend {
    inner: Mutex<MemoryEntries>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_entries(clock, DEFAULT_MEMORY_CACHE_ENTRIES)
    }

    pub fn with_max_entries(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryEntries::default()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheBackendError> {
        let now = self.clock.now_epoch_seconds();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(expires_at) = inner.entries.get(key).map(|entry| entry.expires_at) else {
            return Ok(None);
        };
        if now >= expires_at {
            inner.entries.remove(key);
            inner.order.retain(|candidate| candidate != key);
            return Ok(None);
        }
        Ok(inner.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheBackendError> {
        let now = self.clock.now_epoch_seconds();
        let expires_at = now.saturating_add(ttl.as_secs().max(1));
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = MemoryEntry { value, expires_at };
        if inner.entries.insert(key.to_string(), entry).is_some() {
            inner.order.retain(|candidate| candidate != key);
        }
        inner.order.push_back(key.to_string());

        while inner.entries.len() > self.max_entries {
            let Some(candidate) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&candidate);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let existed = inner.entries.remove(key).is_some();
        if existed {
            inner.order.retain(|candidate| candidate != key);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer(clock: Arc<ManualClock>) -> (Arc<MemoryCacheBackend>, CacheLayer) {
        let backend = Arc::new(MemoryCacheBackend::new(clock));
        let layer = CacheLayer::new(backend.clone(), CacheConfig::default());
        (backend, layer)
    }

    #[test]
    fn cache_key_is_stable_across_map_ordering() {
        let mut a = HashMap::new();
        a.insert("q", "acme");
        a.insert("sort", "published");
        let b: BTreeMap<_, _> = a.iter().map(|(k, v)| (*k, *v)).collect();

        let key_a = CacheLayer::cache_key("news_lookup", &a).unwrap();
        let key_b = CacheLayer::cache_key("news_lookup", &b).unwrap();
        assert_eq!(key_a, key_b);
        assert!(key_a.starts_with("news_lookup:"));
        assert_ne!(key_a, CacheLayer::cache_key("other", &a).unwrap());
        assert_ne!(key_a, CacheLayer::cache_key("news_lookup", &("acme",)).unwrap());
    }

    #[tokio::test]
    async fn with_cache_does_not_store_errors() {
        let clock = Arc::new(ManualClock::new(0));
        let (backend, layer) = layer(clock);
        let calls = AtomicUsize::new(0);

        let first: Result<u32, &str> = layer
            .with_cache("op", &1, Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("upstream down")
            })
            .await;
        assert_eq!(first, Err("upstream down"));
        assert!(backend.is_empty());

        let second: Result<u32, &str> = layer
            .with_cache("op", &1, Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(second, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undecodable_entries_are_misses() {
        let clock = Arc::new(ManualClock::new(0));
        let (backend, layer) = layer(clock);
        let key = CacheLayer::cache_key("op", &"arg").unwrap();
        backend
            .set(&key, b"{not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let value: Result<String, Infallible> = layer
            .with_cache("op", &"arg", Duration::from_secs(60), || async {
                Ok("fresh".to_string())
            })
            .await;
        assert_eq!(value.unwrap(), "fresh");
        assert!(matches!(layer.lookup::<String>(&key).await, CacheLookup::Hit(v) if v == "fresh"));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let (_backend, layer) = layer(clock);
        let _: Result<u8, Infallible> = layer
            .with_cache("status", &("a", 1), Duration::from_secs(60), || async { Ok(1) })
            .await;

        assert!(layer.invalidate("status", &("a", 1)).await);
        assert!(!layer.invalidate("status", &("a", 1)).await);
    }

    #[tokio::test]
    async fn disabled_layer_always_calls_through() {
        let layer = CacheLayer::disabled();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _: Result<u8, Infallible> = layer
                .with_cache("op", &(), Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!layer.invalidate("op", &()).await);
    }

    #[tokio::test]
    async fn memory_backend_evicts_oldest_over_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = MemoryCacheBackend::with_max_entries(clock, 2);
        for key in ["a", "b", "c"] {
            backend
                .set(key, b"1".to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(backend.get("a").await.unwrap().is_none());
        assert!(backend.get("b").await.unwrap().is_some());
        assert!(backend.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_backend_expires_entries() {
        let clock = Arc::new(ManualClock::new(100));
        let backend = MemoryCacheBackend::new(clock.clone());
        backend
            .set("k", b"1".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        clock.set(104);
        assert!(backend.get("k").await.unwrap().is_some());
        clock.set(105);
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }
}
