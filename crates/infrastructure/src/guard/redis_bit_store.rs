//! Redis 位图存储（SETBIT / GETBIT）

use async_trait::async_trait;
use quant_cache_core::cache::RedisConnectionPool;
use quant_cache_domain::{BitStore, TierError};
use redis::AsyncCommands;
use tracing::warn;

pub struct RedisBitStore {
    pool: RedisConnectionPool,
    key: String,
}

impl RedisBitStore {
    pub fn new(pool: RedisConnectionPool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }
}

#[async_trait]
impl BitStore for RedisBitStore {
    async fn get_bit(&self, offset: u64) -> Result<bool, TierError> {
        let mut conn = self.pool.get_connection();
        let bit: bool = conn
            .getbit(&self.key, offset as usize)
            .await
            .map_err(|e| {
                warn!(key = %self.key, offset, error = %e, "GETBIT 失败");
                TierError::Unavailable(e.to_string())
            })?;
        Ok(bit)
    }

    async fn set_bit(&self, offset: u64) -> Result<(), TierError> {
        let mut conn = self.pool.get_connection();
        let _previous: bool = conn
            .setbit(&self.key, offset as usize, true)
            .await
            .map_err(|e| {
                warn!(key = %self.key, offset, error = %e, "SETBIT 失败");
                TierError::Unavailable(e.to_string())
            })?;
        Ok(())
    }
}
