//! 单飞协调器
//!
//! 同一计算键在整个集群内同一时刻至多一次 `compute()`：
//! - 进程内：首个调用方原子地创建待定槽位，之后的调用方挂在槽位上等待同一个结果
//! - 跨进程：只有槽位所有者去竞争集群租约，租约在持有者崩溃后自动过期
//!
//! 协调器本身不存储结果，只负责裁决谁来计算、把结果分发给等待者，
//! 写入由调用方提供的 `commit` 完成，并且只在提交时仍持有租约的情况下执行。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quant_cache_core::config::LeaseConfig;
use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::LeaseService;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::lease_guard::{bounded, LeaseGuard, LEASE_CALL_GRACE};

#[derive(Error, Debug, Clone)]
pub enum SingleflightError {
    #[error("计算失败: {0}")]
    Compute(Arc<anyhow::Error>),

    #[error("计算超出租约时长")]
    LeaseExpired,

    #[error("计算被放弃")]
    Abandoned,
}

/// 等待与租约参数，三者都必须有限
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOptions {
    pub wait_timeout: Duration,
    pub lease_duration: Duration,
    pub local_wait_timeout: Duration,
}

impl From<&LeaseConfig> for LeaseOptions {
    fn from(config: &LeaseConfig) -> Self {
        Self {
            wait_timeout: config.wait_timeout,
            lease_duration: config.lease_duration,
            local_wait_timeout: config.local_wait_timeout,
        }
    }
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightOrigin {
    /// 本调用方持有租约并执行了计算
    Leader,
    /// 挂在本进程的待定槽位上拿到了别人的结果
    Follower,
    /// 降级结果
    Fallback,
}

#[derive(Debug, Clone)]
pub struct FlightResult<T> {
    pub value: T,
    pub origin: FlightOrigin,
}

#[derive(Clone)]
enum SlotState<T> {
    Pending,
    Ready(T),
    Failed(SingleflightError),
    /// 集群内另一进程正在计算，本进程拿不到结果
    Busy,
}

/// 进程内待定计算：只写一次的结果槽位
struct PendingComputation<T> {
    tx: watch::Sender<SlotState<T>>,
    waiters: AtomicUsize,
}

impl<T> PendingComputation<T> {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::Pending);
        Self {
            tx,
            waiters: AtomicUsize::new(0),
        }
    }

    fn resolve(&self, state: SlotState<T>) {
        self.tx.send_if_modified(|current| {
            if matches!(current, SlotState::Pending) {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// 槽位所有者的清理句柄：任何退出路径（包括被取消）都会解析槽位并从表中移除
struct SlotOwner<'a, T> {
    pending: &'a DashMap<String, Arc<PendingComputation<T>>>,
    key: &'a str,
    slot: Arc<PendingComputation<T>>,
}

impl<T> SlotOwner<'_, T> {
    fn complete(&self, state: SlotState<T>) {
        self.slot.resolve(state);
        self.pending
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, &self.slot));
    }
}

impl<T> Drop for SlotOwner<'_, T> {
    fn drop(&mut self) {
        self.complete(SlotState::Failed(SingleflightError::Abandoned));
    }
}

pub struct SingleflightCoordinator<T> {
    lease: Arc<dyn LeaseService>,
    lease_prefix: String,
    options: LeaseOptions,
    pending: DashMap<String, Arc<PendingComputation<T>>>,
    metrics: Arc<CacheMetrics>,
}

impl<T> SingleflightCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        lease: Arc<dyn LeaseService>,
        lease_prefix: impl Into<String>,
        options: LeaseOptions,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            lease,
            lease_prefix: lease_prefix.into(),
            options,
            pending: DashMap::new(),
            metrics,
        }
    }

    pub fn options(&self) -> &LeaseOptions {
        &self.options
    }

    /// 本进程是否有该键的计算在进行
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}:{}", self.lease_prefix, key)
    }

    /// 使用默认等待与租约参数
    pub async fn execute_exclusive<F, Fut, C, CFut, B>(
        &self,
        key: &str,
        compute: F,
        commit: C,
        fallback: B,
    ) -> Result<FlightResult<T>, SingleflightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: FnOnce(T) -> CFut,
        CFut: Future<Output = ()>,
        B: FnOnce() -> T,
    {
        let options = self.options.clone();
        self.execute_exclusive_with_options(key, &options, compute, commit, fallback)
            .await
    }

    /// 在集群范围内互斥地执行 `compute`
    ///
    /// - 成功：先 `commit`（仅当仍持有租约），再把结果交给本进程的等待者，最后释放租约
    /// - 失败：错误原样交给调用方和所有等待者，不缓存，租约照常释放
    /// - 等不到租约或本地等待超时：返回 `fallback()`
    pub async fn execute_exclusive_with_options<F, Fut, C, CFut, B>(
        &self,
        key: &str,
        options: &LeaseOptions,
        compute: F,
        commit: C,
        fallback: B,
    ) -> Result<FlightResult<T>, SingleflightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: FnOnce(T) -> CFut,
        CFut: Future<Output = ()>,
        B: FnOnce() -> T,
    {
        let (slot, is_owner) = match self.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(PendingComputation::new());
                vacant.insert(Arc::clone(&slot));
                (slot, true)
            }
        };
        if !is_owner {
            return self.follow(key, slot, options, fallback).await;
        }
        let owner = SlotOwner {
            pending: &self.pending,
            key,
            slot,
        };

        let lease_key = self.lease_key(key);
        let acquired = bounded(
            options.wait_timeout + LEASE_CALL_GRACE,
            self.lease
                .try_acquire(&lease_key, options.wait_timeout, options.lease_duration),
        )
        .await;
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, lease_key = %lease_key, "租约被其他进程持有，降级");
                owner.complete(SlotState::Busy);
                return Ok(self.fallback(fallback));
            }
            Err(e) => {
                // 无法确认独占时拒绝计算
                error!(key = %key, lease_key = %lease_key, error = %e, "租约服务不可达，降级");
                owner.complete(SlotState::Busy);
                return Ok(self.fallback(fallback));
            }
        }

        let mut lease = LeaseGuard::new(Arc::clone(&self.lease), lease_key.clone());
        self.metrics.record_computation();

        let outcome = match tokio::time::timeout(options.lease_duration, compute()).await {
            Err(_) => Err(SingleflightError::LeaseExpired),
            Ok(Err(e)) => Err(SingleflightError::Compute(Arc::new(e))),
            Ok(Ok(value)) => Ok(value),
        };

        let result = match outcome {
            Ok(value) => {
                match bounded(LEASE_CALL_GRACE, self.lease.is_held_by_caller(&lease_key)).await {
                    Ok(true) => commit(value.clone()).await,
                    Ok(false) => {
                        warn!(key = %key, lease_key = %lease_key, "提交前租约已失效，跳过写入")
                    }
                    Err(e) => {
                        warn!(key = %key, lease_key = %lease_key, error = %e, "无法确认租约，跳过写入")
                    }
                }
                let waiters = owner.slot.waiters.load(Ordering::Relaxed);
                owner.complete(SlotState::Ready(value.clone()));
                if waiters > 0 {
                    debug!(key = %key, waiters, "结果已分发给本地等待者");
                }
                Ok(FlightResult {
                    value,
                    origin: FlightOrigin::Leader,
                })
            }
            Err(err) => {
                self.metrics.record_compute_failure();
                warn!(key = %key, error = %err, "计算失败");
                owner.complete(SlotState::Failed(err.clone()));
                Err(err)
            }
        };

        lease.release().await;
        result
    }

    async fn follow<B>(
        &self,
        key: &str,
        slot: Arc<PendingComputation<T>>,
        options: &LeaseOptions,
        fallback: B,
    ) -> Result<FlightResult<T>, SingleflightError>
    where
        B: FnOnce() -> T,
    {
        slot.waiters.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_coalesced_waiter();
        let mut rx = slot.tx.subscribe();

        let waited = tokio::time::timeout(
            options.local_wait_timeout,
            rx.wait_for(|state| !matches!(state, SlotState::Pending)),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => SlotState::Failed(SingleflightError::Abandoned),
            Err(_) => {
                info!(key = %key, "本地等待超时，降级");
                return Ok(self.fallback(fallback));
            }
        };

        match state {
            SlotState::Ready(value) => Ok(FlightResult {
                value,
                origin: FlightOrigin::Follower,
            }),
            SlotState::Failed(err) => Err(err),
            SlotState::Busy | SlotState::Pending => Ok(self.fallback(fallback)),
        }
    }

    fn fallback<B>(&self, fallback: B) -> FlightResult<T>
    where
        B: FnOnce() -> T,
    {
        self.metrics.record_fallback();
        FlightResult {
            value: fallback(),
            origin: FlightOrigin::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quant_cache_infrastructure::InMemoryLeaseService;
    use std::sync::atomic::AtomicUsize;

    fn options() -> LeaseOptions {
        LeaseOptions {
            wait_timeout: Duration::from_millis(200),
            lease_duration: Duration::from_secs(5),
            local_wait_timeout: Duration::from_secs(2),
        }
    }

    fn coordinator(lease: &InMemoryLeaseService) -> Arc<SingleflightCoordinator<u64>> {
        Arc::new(SingleflightCoordinator::new(
            Arc::new(lease.clone()),
            "lock",
            options(),
            Arc::new(CacheMetrics::new()),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_callers_coalesce_onto_one_compute() {
        let lease = InMemoryLeaseService::default();
        let coordinator = coordinator(&lease);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coordinator
                    .execute_exclusive(
                        "k",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(42)
                        },
                        |_| async {},
                        || 0,
                    )
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.value, 42);
            if result.origin == FlightOrigin::Leader {
                leaders += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(!lease.is_held_by_caller("lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_compute_error_reaches_every_waiter_and_releases_lease() {
        let lease = InMemoryLeaseService::default();
        let coordinator = coordinator(&lease);
        let committed = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            let committed = Arc::clone(&committed);
            tokio::spawn(async move {
                coordinator
                    .execute_exclusive(
                        "k",
                        || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(anyhow::anyhow!("source down"))
                        },
                        move |_| async move {
                            committed.fetch_add(1, Ordering::SeqCst);
                        },
                        || 0,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = coordinator
            .execute_exclusive("k", || async { Ok(1) }, |_| async {}, || 0)
            .await;

        assert!(matches!(follower, Err(SingleflightError::Compute(_))));
        assert!(matches!(leader.await.unwrap(), Err(SingleflightError::Compute(_))));
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert!(!lease.is_held_by_caller("lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_busy_lease_returns_fallback() {
        let lease = InMemoryLeaseService::default();
        let other_process = lease.peer();
        assert!(other_process
            .try_acquire("lock:k", Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap());

        let coordinator = coordinator(&lease);
        let result = coordinator
            .execute_exclusive("k", || async { Ok(1) }, |_| async {}, || 7)
            .await
            .unwrap();
        assert_eq!(result.value, 7);
        assert_eq!(result.origin, FlightOrigin::Fallback);
    }

    #[tokio::test]
    async fn test_unreachable_lease_service_fails_closed() {
        let lease = InMemoryLeaseService::default();
        lease.set_reachable(false);
        let coordinator = coordinator(&lease);
        let calls = AtomicUsize::new(0);

        let result = coordinator
            .execute_exclusive(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                },
                |_| async {},
                || 9,
            )
            .await
            .unwrap();
        assert_eq!(result.origin, FlightOrigin::Fallback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_is_bounded_by_lease_duration() {
        let lease = InMemoryLeaseService::default();
        let coordinator = Arc::new(SingleflightCoordinator::new(
            Arc::new(lease.clone()),
            "lock",
            LeaseOptions {
                wait_timeout: Duration::from_millis(100),
                lease_duration: Duration::from_secs(2),
                local_wait_timeout: Duration::from_secs(10),
            },
            Arc::new(CacheMetrics::new()),
        ));

        let result = coordinator
            .execute_exclusive(
                "k",
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1u64)
                },
                |_| async {},
                || 0,
            )
            .await;
        assert!(matches!(result, Err(SingleflightError::LeaseExpired)));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    /// 获取成功但随后「丢失」租约的服务
    struct LosingLease(InMemoryLeaseService);

    #[async_trait::async_trait]
    impl LeaseService for LosingLease {
        async fn try_acquire(
            &self,
            lease_key: &str,
            wait_timeout: Duration,
            lease_timeout: Duration,
        ) -> Result<bool, quant_cache_domain::LeaseError> {
            self.0.try_acquire(lease_key, wait_timeout, lease_timeout).await
        }

        async fn release(&self, lease_key: &str) -> Result<(), quant_cache_domain::LeaseError> {
            self.0.release(lease_key).await
        }

        async fn is_held_by_caller(
            &self,
            _lease_key: &str,
        ) -> Result<bool, quant_cache_domain::LeaseError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_commit_skipped_when_lease_lost() {
        let coordinator = SingleflightCoordinator::new(
            Arc::new(LosingLease(InMemoryLeaseService::default())),
            "lock",
            options(),
            Arc::new(CacheMetrics::new()),
        );
        let committed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&committed);

        let result = coordinator
            .execute_exclusive(
                "k",
                || async { Ok(3u64) },
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                || 0,
            )
            .await
            .unwrap();

        // 计算结果仍返回给调用方，但不写入缓存
        assert_eq!(result.value, 3);
        assert_eq!(result.origin, FlightOrigin::Leader);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_slot_and_lease() {
        let lease = InMemoryLeaseService::default();
        let coordinator = coordinator(&lease);

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .execute_exclusive(
                        "k",
                        || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(1)
                        },
                        |_| async {},
                        || 0,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.is_in_flight("k"));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .execute_exclusive("k", || async { Ok(2) }, |_| async {}, || 0)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        assert!(matches!(waiter.await.unwrap(), Err(SingleflightError::Abandoned)));
        assert!(!coordinator.is_in_flight("k"));
        // 释放在后台任务中完成
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lease.is_held_by_caller("lock:k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_falls_back_after_local_wait_while_leader_completes() {
        let lease = InMemoryLeaseService::default();
        let metrics = Arc::new(CacheMetrics::new());
        let coordinator = Arc::new(SingleflightCoordinator::new(
            Arc::new(lease.clone()),
            "lock",
            LeaseOptions {
                wait_timeout: Duration::from_millis(100),
                lease_duration: Duration::from_secs(120),
                local_wait_timeout: Duration::from_secs(3),
            },
            Arc::clone(&metrics),
        ));

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .execute_exclusive(
                        "k",
                        || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(5u64)
                        },
                        |_| async {},
                        || 0,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_in_flight("k"));

        let started = tokio::time::Instant::now();
        let follower = coordinator
            .execute_exclusive("k", || async { Ok(9) }, |_| async {}, || 7)
            .await
            .unwrap();
        let waited = started.elapsed();
        assert_eq!(follower.origin, FlightOrigin::Fallback);
        assert_eq!(follower.value, 7);
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
        // 等待者超时不影响仍在计算的持有者
        assert!(coordinator.is_in_flight("k"));

        let leader = leader.await.unwrap().unwrap();
        assert_eq!(leader.origin, FlightOrigin::Leader);
        assert_eq!(leader.value, 5);
        assert_eq!(metrics.snapshot().fallbacks, 1);
        assert!(!lease.is_held_by_caller("lock:k").await.unwrap());
    }

    /// 连接未断但永不响应的租约服务；`acquire` 为 true 时获取正常，其余调用卡住
    struct StalledLease {
        inner: InMemoryLeaseService,
        acquire: bool,
    }

    #[async_trait::async_trait]
    impl LeaseService for StalledLease {
        async fn try_acquire(
            &self,
            lease_key: &str,
            wait_timeout: Duration,
            lease_timeout: Duration,
        ) -> Result<bool, quant_cache_domain::LeaseError> {
            if !self.acquire {
                std::future::pending::<()>().await;
            }
            self.inner.try_acquire(lease_key, wait_timeout, lease_timeout).await
        }

        async fn release(&self, _lease_key: &str) -> Result<(), quant_cache_domain::LeaseError> {
            std::future::pending().await
        }

        async fn is_held_by_caller(
            &self,
            _lease_key: &str,
        ) -> Result<bool, quant_cache_domain::LeaseError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lease_acquire_fails_closed_within_bound() {
        let coordinator = SingleflightCoordinator::new(
            Arc::new(StalledLease {
                inner: InMemoryLeaseService::default(),
                acquire: false,
            }),
            "lock",
            options(),
            Arc::new(CacheMetrics::new()),
        );
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let result = coordinator
            .execute_exclusive(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u64)
                },
                |_| async {},
                || 9,
            )
            .await
            .unwrap();
        assert_eq!(result.origin, FlightOrigin::Fallback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() <= options().wait_timeout + LEASE_CALL_GRACE);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lease_check_skips_commit() {
        let coordinator = SingleflightCoordinator::new(
            Arc::new(StalledLease {
                inner: InMemoryLeaseService::default(),
                acquire: true,
            }),
            "lock",
            options(),
            Arc::new(CacheMetrics::new()),
        );
        let committed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&committed);

        let result = coordinator
            .execute_exclusive(
                "k",
                || async { Ok(4u64) },
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                || 0,
            )
            .await
            .unwrap();
        assert_eq!(result.origin, FlightOrigin::Leader);
        assert_eq!(result.value, 4);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }
}
