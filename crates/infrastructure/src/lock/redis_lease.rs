//! Redis 租约：`SET key token NX PX ms` 获取，Lua 比较后删除释放
//!
//! 每次获取生成新的随机 token，只有 token 匹配时才会释放，
//! 租约过期后被他人接手的键不会被误删。

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use quant_cache_core::cache::RedisConnectionPool;
use quant_cache_domain::{LeaseError, LeaseService};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::Instant;
use tracing::{debug, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLeaseService {
    pool: RedisConnectionPool,
    retry_interval: Duration,
    /// lease_key -> 本进程持有的 token
    tokens: DashMap<String, String>,
    release_script: Script,
}

impl RedisLeaseService {
    pub fn new(pool: RedisConnectionPool, retry_interval: Duration) -> Self {
        Self {
            pool,
            retry_interval,
            tokens: DashMap::new(),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    async fn try_set(
        conn: &mut ConnectionManager,
        lease_key: &str,
        token: &str,
        lease_ms: u64,
    ) -> Result<bool, LeaseError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(conn)
            .await
            .map_err(unreachable)?;
        Ok(reply.is_some())
    }
}

fn unreachable(e: redis::RedisError) -> LeaseError {
    LeaseError::Unreachable(e.to_string())
}

#[async_trait]
impl LeaseService for RedisLeaseService {
    async fn try_acquire(
        &self,
        lease_key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.pool.get_connection();
        let token = uuid::Uuid::new_v4().to_string();
        let lease_ms = lease_timeout.as_millis().max(1) as u64;
        let deadline = Instant::now() + wait_timeout;

        loop {
            if Self::try_set(&mut conn, lease_key, &token, lease_ms).await? {
                self.tokens.insert(lease_key.to_string(), token);
                debug!(lease_key = %lease_key, lease_ms, "获取租约成功");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(lease_key = %lease_key, "等待租约超时");
                return Ok(false);
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease_key: &str) -> Result<(), LeaseError> {
        let Some((_, token)) = self.tokens.remove(lease_key) else {
            return Ok(());
        };
        let mut conn = self.pool.get_connection();
        let deleted: i64 = self
            .release_script
            .key(lease_key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await
            .map_err(unreachable)?;
        if deleted == 0 {
            warn!(lease_key = %lease_key, "释放时租约已过期或被接手");
        }
        Ok(())
    }

    async fn is_held_by_caller(&self, lease_key: &str) -> Result<bool, LeaseError> {
        let Some(token) = self.tokens.get(lease_key).map(|t| t.value().clone()) else {
            return Ok(false);
        };
        let mut conn = self.pool.get_connection();
        let current: Option<String> = redis::cmd("GET")
            .arg(lease_key)
            .query_async(&mut conn)
            .await
            .map_err(unreachable)?;
        Ok(current.as_deref() == Some(token.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> RedisLeaseService {
        let url = std::env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
        let pool = RedisConnectionPool::new(&url).await.unwrap();
        RedisLeaseService::new(pool, Duration::from_millis(20))
    }

    #[tokio::test]
    #[ignore] // 需要本地 Redis
    async fn test_lease_is_exclusive_and_expires() {
        let a = service().await;
        let b = service().await;
        let key = format!("quant-cache-test:lock:{}", uuid::Uuid::new_v4());

        assert!(a
            .try_acquire(&key, Duration::ZERO, Duration::from_millis(500))
            .await
            .unwrap());
        assert!(a.is_held_by_caller(&key).await.unwrap());
        assert!(!b
            .try_acquire(&key, Duration::from_millis(100), Duration::from_millis(500))
            .await
            .unwrap());
        assert!(b
            .try_acquire(&key, Duration::from_secs(2), Duration::from_millis(500))
            .await
            .unwrap());
        // a 的租约已过期，释放不会删掉 b 的租约
        a.release(&key).await.unwrap();
        assert!(b.is_held_by_caller(&key).await.unwrap());
        b.release(&key).await.unwrap();
        assert!(!b.is_held_by_caller(&key).await.unwrap());
    }
}
