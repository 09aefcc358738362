//! Redis 共享缓存层（L2）

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use quant_cache_core::cache::RedisConnectionPool;
use quant_cache_domain::{SharedCacheTier, TierError};
use redis::{AsyncCommands, RedisResult};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, warn};

const SCAN_BATCH: usize = 200;

pub struct RedisSharedTier {
    pool: RedisConnectionPool,
    retry_delay: Duration,
}

impl RedisSharedTier {
    pub fn new(pool: RedisConnectionPool) -> Self {
        Self {
            pool,
            retry_delay: Duration::from_millis(20),
        }
    }

    /// 网络抖动时原地重试一次，之后交给调用方降级
    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        key: &str,
        action: F,
    ) -> Result<T, TierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let strategy = FixedInterval::new(self.retry_delay).take(1);
        Retry::spawn(strategy, action).await.map_err(|e| {
            warn!(key = %key, op, error = %e, "Redis 共享缓存操作失败");
            TierError::Unavailable(e.to_string())
        })
    }
}

#[async_trait]
impl SharedCacheTier for RedisSharedTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.with_retry("GET", key, || {
            let mut conn = self.pool.get_connection();
            let key = key.to_string();
            async move {
                let value: Option<Vec<u8>> = conn.get(key).await?;
                Ok::<_, redis::RedisError>(value)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), TierError> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.with_retry("SET", key, || {
            let mut conn = self.pool.get_connection();
            let key = key.to_string();
            let value = value.clone();
            async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<_, ()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        let deleted: i64 = self
            .with_retry("DEL", key, || {
                let mut conn = self.pool.get_connection();
                let key = key.to_string();
                async move {
                    let deleted: i64 = conn.del(key).await?;
                    Ok::<_, redis::RedisError>(deleted)
                }
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        let mut conn = self.pool.get_connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(pattern = %pattern, error = %e, "Redis SCAN 失败");
                    TierError::Unavailable(e.to_string())
                })?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN 可能返回重复键
        keys.sort();
        keys.dedup();
        debug!(pattern = %pattern, count = keys.len(), "SCAN 完成");
        Ok(keys)
    }
}
