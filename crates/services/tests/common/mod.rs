//! 多「进程」测试装配
//!
//! 每个 `Process` 拥有自己的 L1、空结果缓存、单飞协调器与监听器，
//! 共享同一套内存版 L2、租约表、位图与事件通道，模拟同一集群内的多个实例。

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::{
    ExpiryPolicy, KeyBuilder, QueryLoader, StockPick, StockPicksPage, StockPicksQuery, TradeDate,
};
use quant_cache_infrastructure::{
    InMemoryBitStore, InMemoryEventChannel, InMemoryLeaseService, InMemorySharedTier, LocalTier,
    NegativeCache, TieredCacheStore,
};
use quant_cache_services::{
    ExistenceGuard, InvalidationListener, LeaseOptions, PartitionGenerations, ReadThroughCache,
    ReadThroughComponents, SingleflightCoordinator,
};

pub type PicksCache = ReadThroughCache<StockPicksQuery, StockPicksPage>;

pub fn trade_date() -> TradeDate {
    TradeDate::from_ymd(2024, 1, 2).unwrap()
}

pub fn pick(code: &str, strategy: &str, score: f64) -> StockPick {
    StockPick {
        code: code.to_string(),
        name: code.to_string(),
        strategy_id: strategy.to_string(),
        industry: Some("bank".to_string()),
        score,
    }
}

/// 可控的慢数据源：统计调用次数，可切换数据或注入失败
pub struct SlowLoader {
    pub calls: AtomicUsize,
    pub delay: Duration,
    picks: Mutex<Vec<StockPick>>,
    failing: Mutex<bool>,
    /// 先读数据再等待，模拟读完源数据后还在做长计算
    read_first: bool,
}

impl SlowLoader {
    pub fn new(delay: Duration, picks: Vec<StockPick>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            picks: Mutex::new(picks),
            failing: Mutex::new(false),
            read_first: false,
        })
    }

    pub fn reading_first(delay: Duration, picks: Vec<StockPick>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            picks: Mutex::new(picks),
            failing: Mutex::new(false),
            read_first: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn replace(&self, picks: Vec<StockPick>) {
        *self.picks.lock().unwrap() = picks;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl QueryLoader<StockPicksQuery, StockPicksPage> for SlowLoader {
    async fn load(&self, query: &StockPicksQuery) -> anyhow::Result<Option<StockPicksPage>> {
        if self.read_first {
            let picks = self.picks.lock().unwrap().clone();
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            return Ok(query.apply(&picks));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if *self.failing.lock().unwrap() {
            anyhow::bail!("picks source unavailable");
        }
        let picks = self.picks.lock().unwrap().clone();
        Ok(query.apply(&picks))
    }
}

/// 集群共享的后端
#[derive(Clone, Default)]
pub struct Cluster {
    pub shared: InMemorySharedTier,
    pub lease: InMemoryLeaseService,
    pub bits: InMemoryBitStore,
    pub channel: InMemoryEventChannel,
}

pub struct Process {
    pub cache: PicksCache,
    pub store: Arc<TieredCacheStore<StockPicksPage>>,
    pub guard: Arc<ExistenceGuard>,
    pub lease: InMemoryLeaseService,
    pub listener: Arc<InvalidationListener<StockPicksPage>>,
    pub metrics: Arc<CacheMetrics>,
}

pub fn lease_options() -> LeaseOptions {
    LeaseOptions {
        wait_timeout: Duration::from_secs(2),
        lease_duration: Duration::from_secs(5),
        local_wait_timeout: Duration::from_secs(3),
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(
        &self,
        name: &str,
        loader: Arc<dyn QueryLoader<StockPicksQuery, StockPicksPage>>,
    ) -> Process {
        self.process_with(name, loader, lease_options())
    }

    pub fn process_with(
        &self,
        name: &str,
        loader: Arc<dyn QueryLoader<StockPicksQuery, StockPicksPage>>,
        options: LeaseOptions,
    ) -> Process {
        let metrics = Arc::new(CacheMetrics::new());
        let keys = KeyBuilder::new("stable", "picks:daily");
        let lease = self.lease.peer();
        let store = Arc::new(TieredCacheStore::new(
            LocalTier::new(1_000, Duration::from_secs(60)),
            Arc::new(self.shared.clone()),
            Arc::clone(&metrics),
        ));
        let guard = Arc::new(ExistenceGuard::new(Arc::new(self.bits.clone()), 73_050));
        let negative = NegativeCache::new(1_000, Duration::from_secs(30));
        let generations = PartitionGenerations::new();
        let coordinator = Arc::new(SingleflightCoordinator::new(
            Arc::new(lease.clone()),
            "lock",
            options,
            Arc::clone(&metrics),
        ));
        let cache = ReadThroughCache::new(ReadThroughComponents {
            keys: keys.clone(),
            guard: Arc::clone(&guard),
            store: Arc::clone(&store),
            coordinator,
            loader,
            negative: negative.clone(),
            expiry: ExpiryPolicy::new(Duration::from_secs(300), 0.5, 0.1),
            metrics: Arc::clone(&metrics),
            generations: generations.clone(),
        });
        let listener = Arc::new(InvalidationListener::new(
            Arc::new(self.channel.subscribe(&format!("cache-invalidator-{}", name))),
            Arc::clone(&store),
            negative,
            Arc::clone(&guard),
            generations,
            keys,
            Arc::clone(&metrics),
            16,
            Duration::from_millis(20),
        ));
        Process {
            cache,
            store,
            guard,
            lease,
            listener,
            metrics,
        }
    }
}

/// 轮询直到条件成立或超时
pub async fn eventually<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
