//! 读穿缓存
//!
//! 读取流程：
//! 1. 存在性守卫判定分区无数据 → 直接返回空，不触碰缓存与数据源
//! 2. 空结果缓存命中 → 返回空
//! 3. L1 → L2（命中回填 L1）
//!    - 新鲜：直接返回
//!    - 软过期：立即返回旧值，后台刷新（同一键同一时刻至多一个刷新）
//!    - 硬过期：视为未命中
//! 4. 未命中经单飞协调器重新计算；拿不到计算权时返回降级结果

use std::sync::Arc;

use dashmap::DashSet;
use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::{
    now_millis, CacheEntry, CacheQuery, ExpiryPolicy, Freshness, KeyBuilder, QueryLoader,
    TradeDate,
};
use quant_cache_infrastructure::{NegativeCache, TieredCacheStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::guard::ExistenceGuard;
use crate::invalidation::PartitionGenerations;
use crate::singleflight::{SingleflightCoordinator, SingleflightError};

/// 一次受协调计算的结果
pub enum Resolved<V> {
    /// 上一任租约持有者已写入 L2 的新鲜条目
    Shared(Arc<CacheEntry<V>>),
    /// 本次从数据源加载
    Loaded(Arc<CacheEntry<V>>),
    /// 数据源确认没有数据
    Missing,
    /// 拿不到计算权，附带本进程已知的最后一个值
    Unavailable(Option<Arc<CacheEntry<V>>>),
}

impl<V> Clone for Resolved<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Shared(entry) => Self::Shared(Arc::clone(entry)),
            Self::Loaded(entry) => Self::Loaded(Arc::clone(entry)),
            Self::Missing => Self::Missing,
            Self::Unavailable(entry) => Self::Unavailable(entry.clone()),
        }
    }
}

/// 读取结果
#[derive(Debug)]
pub enum Lookup<V> {
    Fresh(Arc<CacheEntry<V>>),
    /// 已软过期，后台刷新已安排
    Stale(Arc<CacheEntry<V>>),
    /// 本次（或本进程内合并的另一次）重新计算得到
    Computed(Arc<CacheEntry<V>>),
    /// 分区或查询确认无数据
    Absent,
    /// 降级结果：其他进程正在计算或等待超时，可能带有已硬过期的最后已知值
    Degraded(Option<Arc<CacheEntry<V>>>),
}

impl<V> Lookup<V> {
    pub fn entry(&self) -> Option<&Arc<CacheEntry<V>>> {
        match self {
            Self::Fresh(entry) | Self::Stale(entry) | Self::Computed(entry) => Some(entry),
            Self::Degraded(entry) => entry.as_ref(),
            Self::Absent => None,
        }
    }

    pub fn value(&self) -> Option<&V> {
        self.entry().map(|entry| entry.value())
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::Stale(_) => "stale",
            Self::Computed(_) => "computed",
            Self::Absent => "absent",
            Self::Degraded(_) => "degraded",
        }
    }
}

/// 读穿缓存的组成部分，由启动装配代码显式构造
pub struct ReadThroughComponents<Q, V> {
    pub keys: KeyBuilder,
    pub guard: Arc<ExistenceGuard>,
    pub store: Arc<TieredCacheStore<V>>,
    pub coordinator: Arc<SingleflightCoordinator<Resolved<V>>>,
    pub loader: Arc<dyn QueryLoader<Q, V>>,
    pub negative: NegativeCache,
    pub expiry: ExpiryPolicy,
    pub metrics: Arc<CacheMetrics>,
    /// 与同进程的失效监听器共享
    pub generations: PartitionGenerations,
}

pub struct ReadThroughCache<Q, V> {
    keys: Arc<KeyBuilder>,
    guard: Arc<ExistenceGuard>,
    store: Arc<TieredCacheStore<V>>,
    coordinator: Arc<SingleflightCoordinator<Resolved<V>>>,
    loader: Arc<dyn QueryLoader<Q, V>>,
    negative: NegativeCache,
    expiry: Arc<ExpiryPolicy>,
    metrics: Arc<CacheMetrics>,
    generations: PartitionGenerations,
    /// 已安排后台刷新的键
    refreshing: Arc<DashSet<String>>,
}

impl<Q, V> Clone for ReadThroughCache<Q, V> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
            guard: Arc::clone(&self.guard),
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            loader: Arc::clone(&self.loader),
            negative: self.negative.clone(),
            expiry: Arc::clone(&self.expiry),
            metrics: Arc::clone(&self.metrics),
            generations: self.generations.clone(),
            refreshing: Arc::clone(&self.refreshing),
        }
    }
}

impl<Q, V> ReadThroughCache<Q, V>
where
    Q: CacheQuery + Clone + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(components: ReadThroughComponents<Q, V>) -> Self {
        Self {
            keys: Arc::new(components.keys),
            guard: components.guard,
            store: components.store,
            coordinator: components.coordinator,
            loader: components.loader,
            negative: components.negative,
            expiry: Arc::new(components.expiry),
            metrics: components.metrics,
            generations: components.generations,
            refreshing: Arc::new(DashSet::new()),
        }
    }

    pub fn key_for(&self, query: &Q) -> String {
        self.keys
            .build_key(&query.partition(), query.filters())
            .into()
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn store(&self) -> &Arc<TieredCacheStore<V>> {
        &self.store
    }

    pub fn guard(&self) -> &Arc<ExistenceGuard> {
        &self.guard
    }

    pub fn negative_cache(&self) -> &NegativeCache {
        &self.negative
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// 某个键是否有后台刷新尚未结束
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.refreshing.contains(key)
    }

    pub async fn get(&self, query: &Q) -> Result<Lookup<V>, SingleflightError> {
        let partition = query.partition();
        if !self.guard.might_exist(&partition).await {
            self.metrics.record_guard_rejection();
            return Ok(Lookup::Absent);
        }

        let key = self.key_for(query);
        if self.negative.contains(&key) {
            self.metrics.record_negative_hit();
            debug!(key = %key, "空结果缓存命中");
            return Ok(Lookup::Absent);
        }

        let mut last_known = None;
        if let Some(entry) = self.store.get_local(&key) {
            match entry.freshness(now_millis()) {
                Freshness::Fresh => {
                    self.metrics.record_l1_hit();
                    return Ok(Lookup::Fresh(entry));
                }
                Freshness::Stale => {
                    self.metrics.record_l1_hit();
                    self.metrics.record_stale_served();
                    self.schedule_refresh(&key, query);
                    return Ok(Lookup::Stale(entry));
                }
                Freshness::Expired => {
                    self.metrics.record_hard_expired();
                    last_known = Some(entry);
                }
            }
        }

        if let Some(entry) = self.store.get_shared(&key).await {
            match entry.freshness(now_millis()) {
                Freshness::Fresh => {
                    self.metrics.record_l2_hit();
                    self.store.put_local_only(&key, Arc::clone(&entry));
                    return Ok(Lookup::Fresh(entry));
                }
                Freshness::Stale => {
                    self.metrics.record_l2_hit();
                    self.metrics.record_stale_served();
                    self.store.put_local_only(&key, Arc::clone(&entry));
                    self.schedule_refresh(&key, query);
                    return Ok(Lookup::Stale(entry));
                }
                Freshness::Expired => self.metrics.record_hard_expired(),
            }
        }

        self.metrics.record_miss();
        self.recompute(&key, query, last_known).await
    }

    async fn recompute(
        &self,
        key: &str,
        query: &Q,
        last_known: Option<Arc<CacheEntry<V>>>,
    ) -> Result<Lookup<V>, SingleflightError> {
        let partition = query.partition();
        // 数据源读取之前记下代数
        let generation = self.generations.current(&partition);
        let flight = self
            .coordinator
            .execute_exclusive(
                key,
                || self.compute(key, query),
                |resolved| self.commit(key, partition, generation, resolved),
                move || Resolved::Unavailable(last_known),
            )
            .await?;

        Ok(match flight.value {
            Resolved::Shared(entry) | Resolved::Loaded(entry) => Lookup::Computed(entry),
            Resolved::Missing => Lookup::Absent,
            Resolved::Unavailable(entry) => Lookup::Degraded(entry),
        })
    }

    /// 持有租约后执行：先看上一任持有者是否已经写好，再去数据源
    async fn compute(&self, key: &str, query: &Q) -> anyhow::Result<Resolved<V>> {
        if let Some(entry) = self.store.get_shared(key).await {
            if entry.freshness(now_millis()) == Freshness::Fresh {
                self.metrics.record_shared_reuse();
                debug!(key = %key, "复用共享层中的新鲜结果");
                return Ok(Resolved::Shared(entry));
            }
        }

        match self.loader.load(query).await? {
            Some(value) => {
                let entry = self.expiry.entry(value, now_millis());
                Ok(Resolved::Loaded(Arc::new(entry)))
            }
            None => Ok(Resolved::Missing),
        }
    }

    async fn commit(
        &self,
        key: &str,
        partition: TradeDate,
        generation: u64,
        resolved: Resolved<V>,
    ) {
        if matches!(resolved, Resolved::Unavailable(_)) {
            return;
        }
        if self.generations.has_moved(&partition, generation) {
            self.metrics.record_stale_commit();
            debug!(key = %key, partition = %partition, "计算期间分区已失效，结果不写回");
            return;
        }

        match resolved {
            Resolved::Loaded(entry) => {
                if let Err(e) = self.store.put(key, entry, self.expiry.ttl).await {
                    // L1 已写入，本进程仍可命中
                    warn!(key = %key, error = %e, "写入共享缓存失败");
                }
                self.guard.record_existing(&partition).await;
            }
            Resolved::Shared(entry) => self.store.put_local_only(key, entry),
            Resolved::Missing => {
                debug!(key = %key, "数据源无数据，记入空结果缓存");
                self.negative.insert(key);
            }
            Resolved::Unavailable(_) => return,
        }

        // 写入期间到达的事件可能先于本次写入完成驱逐
        if self.generations.has_moved(&partition, generation) {
            self.metrics.record_stale_commit();
            self.negative.invalidate(key);
            if let Err(e) = self.store.evict(key).await {
                warn!(key = %key, error = %e, "撤回过期写入失败");
            }
            debug!(key = %key, partition = %partition, "写入期间分区已失效，已撤回");
        }
    }

    /// 安排后台刷新；同一键已有刷新在进行时什么也不做
    fn schedule_refresh(&self, key: &str, query: &Q) {
        let Some(slot) = RefreshSlot::claim(&self.refreshing, key) else {
            return;
        };
        self.metrics.record_refresh_scheduled();

        let this = self.clone();
        let key = key.to_string();
        let query = query.clone();
        tokio::spawn(async move {
            // 刷新任务 panic 时同样归还标记
            let _slot = slot;
            match this.recompute(&key, &query, None).await {
                Ok(lookup) => debug!(key = %key, outcome = lookup.label(), "后台刷新完成"),
                Err(e) => warn!(key = %key, error = %e, "后台刷新失败，保留旧值"),
            }
        });
    }
}

/// 某个键的后台刷新标记，释放时从集合中移除
struct RefreshSlot {
    refreshing: Arc<DashSet<String>>,
    key: String,
}

impl RefreshSlot {
    fn claim(refreshing: &Arc<DashSet<String>>, key: &str) -> Option<Self> {
        refreshing.insert(key.to_string()).then(|| Self {
            refreshing: Arc::clone(refreshing),
            key: key.to_string(),
        })
    }
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::singleflight::LeaseOptions;
    use async_trait::async_trait;
    use quant_cache_domain::{StockPick, StockPicksPage, StockPicksQuery};
    use quant_cache_infrastructure::{
        InMemoryBitStore, InMemoryLeaseService, InMemorySharedTier, LocalTier,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLoader {
        calls: AtomicUsize,
        picks: Vec<StockPick>,
    }

    #[async_trait]
    impl QueryLoader<StockPicksQuery, StockPicksPage> for CountingLoader {
        async fn load(&self, query: &StockPicksQuery) -> anyhow::Result<Option<StockPicksPage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(query.apply(&self.picks))
        }
    }

    fn date() -> TradeDate {
        TradeDate::from_ymd(2024, 1, 2).unwrap()
    }

    struct PanickingLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueryLoader<StockPicksQuery, StockPicksPage> for PanickingLoader {
        async fn load(&self, _query: &StockPicksQuery) -> anyhow::Result<Option<StockPicksPage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("picks loader bug");
        }
    }

    fn build(
        shared: &InMemorySharedTier,
        loader: Arc<dyn QueryLoader<StockPicksQuery, StockPicksPage>>,
    ) -> ReadThroughCache<StockPicksQuery, StockPicksPage> {
        let metrics = Arc::new(CacheMetrics::new());
        let bits = InMemoryBitStore::new();
        ReadThroughCache::new(ReadThroughComponents {
            keys: KeyBuilder::new("stable", "picks:daily"),
            guard: Arc::new(ExistenceGuard::new(Arc::new(bits), 73_050)),
            store: Arc::new(TieredCacheStore::new(
                LocalTier::new(100, Duration::from_secs(60)),
                Arc::new(shared.clone()),
                Arc::clone(&metrics),
            )),
            coordinator: Arc::new(SingleflightCoordinator::new(
                Arc::new(InMemoryLeaseService::default()),
                "lock",
                LeaseOptions {
                    wait_timeout: Duration::from_millis(200),
                    lease_duration: Duration::from_secs(5),
                    local_wait_timeout: Duration::from_secs(2),
                },
                Arc::clone(&metrics),
            )),
            loader,
            negative: NegativeCache::new(100, Duration::from_secs(30)),
            expiry: ExpiryPolicy::new(Duration::from_secs(300), 0.5, 0.0),
            metrics,
            generations: PartitionGenerations::new(),
        })
    }

    fn loader() -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            picks: vec![StockPick {
                code: "600000".to_string(),
                name: "浦发银行".to_string(),
                strategy_id: "macd".to_string(),
                industry: Some("bank".to_string()),
                score: 0.8,
            }],
        })
    }

    #[tokio::test]
    async fn test_unmarked_partition_short_circuits() {
        let shared = InMemorySharedTier::new();
        let loader = loader();
        let cache = build(&shared, loader.clone());

        let lookup = cache.get(&StockPicksQuery::new(date())).await.unwrap();
        assert!(matches!(lookup, Lookup::Absent));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(shared.read_count(), 0);
        assert_eq!(cache.metrics().snapshot().guard_rejections, 1);
    }

    #[tokio::test]
    async fn test_miss_computes_then_hits_l1() {
        let shared = InMemorySharedTier::new();
        let loader = loader();
        let cache = build(&shared, loader.clone());
        cache.guard().record_existing(&date()).await;
        let query = StockPicksQuery::new(date());

        let first = cache.get(&query).await.unwrap();
        assert!(matches!(first, Lookup::Computed(_)));
        assert_eq!(first.value().unwrap().total, 1);

        let second = cache.get(&query).await.unwrap();
        assert!(matches!(second, Lookup::Fresh(_)));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(shared.contains(&cache.key_for(&query)));
    }

    #[tokio::test]
    async fn test_empty_result_is_remembered_locally() {
        let shared = InMemorySharedTier::new();
        let loader = loader();
        let cache = build(&shared, loader.clone());
        cache.guard().record_existing(&date()).await;
        let query = StockPicksQuery::new(date()).with_strategy("vegas");

        assert!(matches!(cache.get(&query).await.unwrap(), Lookup::Absent));
        assert!(matches!(cache.get(&query).await.unwrap(), Lookup::Absent));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        // 空结果不写共享层
        assert!(!shared.contains(&cache.key_for(&query)));
        assert_eq!(cache.metrics().snapshot().negative_hits, 1);
    }

    #[tokio::test]
    async fn test_hard_expired_entry_is_not_served() {
        let shared = InMemorySharedTier::new();
        let loader = loader();
        let cache = build(&shared, loader.clone());
        cache.guard().record_existing(&date()).await;
        let query = StockPicksQuery::new(date());
        let key = cache.key_for(&query);

        let now = now_millis();
        let expired = CacheEntry::with_deadlines(
            StockPicksPage {
                trade_date: date(),
                items: Vec::new(),
                total: 99,
                page: 1,
                page_size: 20,
            },
            now - 10_000,
            now - 5_000,
            now - 1,
        )
        .unwrap();
        cache.store().put_local_only(&key, Arc::new(expired));

        let lookup = cache.get(&query).await.unwrap();
        assert!(matches!(lookup, Lookup::Computed(_)));
        assert_eq!(lookup.value().unwrap().total, 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_refresh_releases_refresh_slot() {
        let shared = InMemorySharedTier::new();
        let loader = Arc::new(PanickingLoader {
            calls: AtomicUsize::new(0),
        });
        let cache = build(&shared, loader.clone());
        cache.guard().record_existing(&date()).await;
        let query = StockPicksQuery::new(date());
        let key = cache.key_for(&query);

        let now = now_millis();
        let stale = CacheEntry::with_deadlines(
            StockPicksPage {
                trade_date: date(),
                items: Vec::new(),
                total: 3,
                page: 1,
                page_size: 20,
            },
            now - 10_000,
            now - 1,
            now + 60_000,
        )
        .unwrap();
        cache.store().put_local_only(&key, Arc::new(stale));

        assert!(matches!(cache.get(&query).await.unwrap(), Lookup::Stale(_)));
        assert!(cache.is_refreshing(&key));
        for _ in 0..100 {
            if !cache.is_refreshing(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.is_refreshing(&key));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        // 标记已归还，下一次读到软过期值会再次安排刷新
        let lookup = cache.get(&query).await.unwrap();
        assert_eq!(lookup.value().unwrap().total, 3);
        assert_eq!(cache.metrics().snapshot().refreshes_scheduled, 2);
    }
}
