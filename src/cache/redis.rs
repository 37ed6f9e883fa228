use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::CacheBackend;
use crate::error::CacheBackendError;

/// Shared cache backend; entries expire through redis `SETEX`.
#[derive(Clone)]
pub struct RedisCacheBackend {
    client: redis::Client,
    prefix: String,
}

impl RedisCacheBackend {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CacheBackendError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "outreach".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), CacheBackendError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_cache(&self, key: &str) -> String {
        format!("{}:cache:{key}", self.prefix)
    }
}

impl std::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheBackendError> {
        let mut conn = self.connection().await?;
        let raw: Option<Vec<u8>> = conn.get(self.key_cache(key)).await?;
        Ok(raw)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheBackendError> {
        let secs = ttl.as_secs().max(1);
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(self.key_cache(key), value, secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheBackendError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(self.key_cache(key)).await?;
        Ok(removed > 0)
    }
}
