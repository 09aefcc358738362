use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};

/// 重连退避：100ms 起按 2 的幂增长，最多 6 次
const RECONNECT_EXPONENT_BASE: u64 = 2;
const RECONNECT_FACTOR_MS: u64 = 100;
const RECONNECT_RETRIES: usize = 6;

/// 共享连接上每条命令的超时
///
/// 服务端卡住（未断开但不响应）时命令以超时错误返回，调用方按「不可用」处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisTimeouts {
    pub response: Duration,
    pub connect: Duration,
}

impl Default for RedisTimeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_millis(1_000),
            connect: Duration::from_millis(3_000),
        }
    }
}

/// Redis 连接池
///
/// 共享一个自动重连的 `ConnectionManager`，克隆开销极低；
/// 需要阻塞读取（如 XREADGROUP BLOCK）的调用方应使用 `dedicated_connection`，避免占用共享通道。
#[derive(Clone)]
pub struct RedisConnectionPool {
    client: Client,
    manager: ConnectionManager,
    url: String,
    timeouts: RedisTimeouts,
}

impl RedisConnectionPool {
    /// 建立连接并立即 PING 一次
    pub async fn new(redis_url: &str) -> AppResult<Self> {
        Self::with_timeouts(redis_url, RedisTimeouts::default()).await
    }

    pub async fn with_timeouts(redis_url: &str, timeouts: RedisTimeouts) -> AppResult<Self> {
        if timeouts.response.is_zero() || timeouts.connect.is_zero() {
            return Err(AppError::ConfigError("Redis 超时必须大于 0".to_string()));
        }
        let client = Client::open(redis_url)
            .map_err(|e| AppError::ConfigError(format!("无效的 Redis 地址 {}: {}", redis_url, e)))?;

        let manager = ConnectionManager::new_with_backoff_and_timeouts(
            client.clone(),
            RECONNECT_EXPONENT_BASE,
            RECONNECT_FACTOR_MS,
            RECONNECT_RETRIES,
            timeouts.response,
            timeouts.connect,
        )
        .await
        .map_err(|e| {
            error!(url = %redis_url, error = %e, "Redis 连接失败");
            AppError::Redis(e)
        })?;

        let pool = Self {
            client,
            manager,
            url: redis_url.to_string(),
            timeouts,
        };
        pool.ping().await?;
        info!(
            url = %redis_url,
            response_timeout_ms = timeouts.response.as_millis() as u64,
            "Redis 连接池已就绪"
        );
        Ok(pool)
    }

    /// 共享连接
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// 独占连接，不设响应超时，阻塞读自行用 BLOCK 限时
    pub async fn dedicated_connection(&self) -> AppResult<MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(url = %self.url, "已获取 Redis 独占连接");
        Ok(conn)
    }

    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.get_connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(AppError::CacheError(format!("意外的 PING 响应: {}", pong)));
        }
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeouts(&self) -> RedisTimeouts {
        self.timeouts
    }
}
