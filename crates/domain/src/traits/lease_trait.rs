//! 集群租约接口

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("租约服务不可达: {0}")]
    Unreachable(String),
}

/// 集群范围的互斥租约
///
/// 「调用方」指持有该服务实例的进程；同一实例上的重复获取视为竞争者，
/// 本地去重由上层的单飞协调器负责。
#[async_trait]
pub trait LeaseService: Send + Sync {
    /// 在 `wait_timeout` 内尝试获取租约，租约在 `lease_timeout` 后自动失效。
    /// 等待超时返回 `Ok(false)`，这是正常情况而不是错误。
    async fn try_acquire(
        &self,
        lease_key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<bool, LeaseError>;

    /// 只释放自己持有的租约；租约已过期或被他人持有时什么也不做
    async fn release(&self, lease_key: &str) -> Result<(), LeaseError>;

    async fn is_held_by_caller(&self, lease_key: &str) -> Result<bool, LeaseError>;
}
