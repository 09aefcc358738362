//! 共享缓存层与位图存储接口

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 跨进程存储端口的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("存储不可用: {0}")]
    Unavailable(String),

    #[error("序列化失败: {0}")]
    Serialization(String),
}

/// 集群可见的共享缓存层（L2）
///
/// 只依赖单键原子的 set/delete，不做读-改-写。
#[async_trait]
pub trait SharedCacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), TierError>;

    /// 返回键是否存在过；键不存在不是错误
    async fn delete(&self, key: &str) -> Result<bool, TierError>;

    /// 按 glob 模式列出键，只用于失效扫描
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, TierError>;
}

/// 位寻址存储，只允许置位
#[async_trait]
pub trait BitStore: Send + Sync {
    async fn get_bit(&self, offset: u64) -> Result<bool, TierError>;

    async fn set_bit(&self, offset: u64) -> Result<(), TierError>;
}
