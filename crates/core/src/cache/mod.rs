//! Redis 连接管理

pub mod redis_client;

// 重新导出
pub use redis_client::{RedisConnectionPool, RedisTimeouts};
