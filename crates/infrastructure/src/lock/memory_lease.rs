//! 内存租约服务
//!
//! `peer()` 得到共享同一租约表、但身份不同的句柄，用来在单进程测试里模拟多个进程。
//! 时间取自 `tokio::time::Instant`，可配合暂停时钟测试租约过期。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quant_cache_domain::{LeaseError, LeaseService};
use tokio::time::Instant;
use uuid::Uuid;

struct Lease {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    leases: Mutex<HashMap<String, Lease>>,
    unreachable: AtomicBool,
}

#[derive(Clone)]
pub struct InMemoryLeaseService {
    inner: Arc<Inner>,
    owner: Uuid,
    retry_interval: Duration,
}

impl Default for InMemoryLeaseService {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl InMemoryLeaseService {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            owner: Uuid::new_v4(),
            retry_interval,
        }
    }

    /// 同一租约表上的另一个「进程」
    pub fn peer(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: Uuid::new_v4(),
            retry_interval: self.retry_interval,
        }
    }

    /// 模拟租约服务不可达（影响所有 peer）
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unreachable("in-memory lease service offline".to_string()));
        }
        Ok(())
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, LeaseError> {
        self.inner
            .leases
            .lock()
            .map_err(|_| LeaseError::Unreachable("lease table poisoned".to_string()))
    }

    fn try_claim(&self, lease_key: &str, lease_timeout: Duration) -> Result<bool, LeaseError> {
        let mut leases = self.leases()?;
        let now = Instant::now();
        match leases.get(lease_key) {
            Some(lease) if lease.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    lease_key.to_string(),
                    Lease {
                        owner: self.owner,
                        expires_at: now + lease_timeout,
                    },
                );
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn try_acquire(
        &self,
        lease_key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<bool, LeaseError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            self.check()?;
            if self.try_claim(lease_key, lease_timeout)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease_key: &str) -> Result<(), LeaseError> {
        self.check()?;
        let mut leases = self.leases()?;
        if leases
            .get(lease_key)
            .map_or(false, |lease| lease.owner == self.owner)
        {
            leases.remove(lease_key);
        }
        Ok(())
    }

    async fn is_held_by_caller(&self, lease_key: &str) -> Result<bool, LeaseError> {
        self.check()?;
        let leases = self.leases()?;
        Ok(leases.get(lease_key).map_or(false, |lease| {
            lease.owner == self.owner && lease.expires_at > Instant::now()
        }))
    }
}
