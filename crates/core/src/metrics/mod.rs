//! 缓存指标
//!
//! 所有计数器均为原子操作，可在任意线程并发累加；`snapshot()` 得到可序列化快照。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    hard_expired: AtomicU64,
    guard_rejections: AtomicU64,
    negative_hits: AtomicU64,
    computations: AtomicU64,
    shared_reuses: AtomicU64,
    coalesced_waiters: AtomicU64,
    fallbacks: AtomicU64,
    compute_failures: AtomicU64,
    refreshes_scheduled: AtomicU64,
    stale_commits: AtomicU64,
    evictions: AtomicU64,
    corrupt_entries: AtomicU64,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub hard_expired: u64,
    pub guard_rejections: u64,
    pub negative_hits: u64,
    pub computations: u64,
    pub shared_reuses: u64,
    pub coalesced_waiters: u64,
    pub fallbacks: u64,
    pub compute_failures: u64,
    pub refreshes_scheduled: u64,
    /// 计算期间分区被失效、结果未写回的次数
    pub stale_commits: u64,
    pub evictions: u64,
    pub corrupt_entries: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    /// (L1 + L2 命中) / (命中 + 未命中)
    pub hit_ratio: f64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_l1_hit => l1_hits,
        record_l2_hit => l2_hits,
        record_miss => misses,
        record_stale_served => stale_served,
        record_hard_expired => hard_expired,
        record_guard_rejection => guard_rejections,
        record_negative_hit => negative_hits,
        record_computation => computations,
        record_shared_reuse => shared_reuses,
        record_coalesced_waiter => coalesced_waiters,
        record_fallback => fallbacks,
        record_compute_failure => compute_failures,
        record_refresh_scheduled => refreshes_scheduled,
        record_stale_commit => stale_commits,
        record_corrupt_entry => corrupt_entries,
        record_event_processed => events_processed,
        record_event_dropped => events_dropped,
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let l1_hits = load(&self.l1_hits);
        let l2_hits = load(&self.l2_hits);
        let misses = load(&self.misses);
        let lookups = l1_hits + l2_hits + misses;
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            (l1_hits + l2_hits) as f64 / lookups as f64
        };

        CacheMetricsSnapshot {
            l1_hits,
            l2_hits,
            misses,
            stale_served: load(&self.stale_served),
            hard_expired: load(&self.hard_expired),
            guard_rejections: load(&self.guard_rejections),
            negative_hits: load(&self.negative_hits),
            computations: load(&self.computations),
            shared_reuses: load(&self.shared_reuses),
            coalesced_waiters: load(&self.coalesced_waiters),
            fallbacks: load(&self.fallbacks),
            compute_failures: load(&self.compute_failures),
            refreshes_scheduled: load(&self.refreshes_scheduled),
            stale_commits: load(&self.stale_commits),
            evictions: load(&self.evictions),
            corrupt_entries: load(&self.corrupt_entries),
            events_processed: load(&self.events_processed),
            events_dropped: load(&self.events_dropped),
            hit_ratio,
        }
    }
}
