//! 租约释放守卫与租约调用限时

use std::sync::Arc;
use std::time::Duration;

use quant_cache_domain::{LeaseError, LeaseService};
use tracing::warn;

/// 单次租约调用在自身等待时间之外允许的额外时长
pub(crate) const LEASE_CALL_GRACE: Duration = Duration::from_secs(1);

/// 给租约调用加上限，超时按不可达处理
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, LeaseError>>,
) -> Result<T, LeaseError> {
    tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
        Err(LeaseError::Unreachable(format!(
            "lease call timed out after {}ms",
            limit.as_millis()
        )))
    })
}

/// 持有中的集群租约
///
/// 正常路径调用 `release().await`；若持有者在计算中途被取消，
/// `Drop` 会在当前运行时上派生一个释放任务，避免其他进程白等到租约到期。
pub(crate) struct LeaseGuard {
    lease: Arc<dyn LeaseService>,
    lease_key: String,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(lease: Arc<dyn LeaseService>, lease_key: String) -> Self {
        Self {
            lease,
            lease_key,
            released: false,
        }
    }

    pub(crate) async fn release(&mut self) {
        self.released = true;
        if let Err(e) = bounded(LEASE_CALL_GRACE, self.lease.release(&self.lease_key)).await {
            // 释放失败不影响结果，租约到期后自然失效
            warn!(lease_key = %self.lease_key, error = %e, "释放租约失败");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lease = Arc::clone(&self.lease);
        let lease_key = std::mem::take(&mut self.lease_key);
        handle.spawn(async move {
            if let Err(e) = bounded(LEASE_CALL_GRACE, lease.release(&lease_key)).await {
                warn!(lease_key = %lease_key, error = %e, "取消后释放租约失败");
            }
        });
    }
}
