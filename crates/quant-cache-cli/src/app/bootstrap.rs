//! # 应用启动装配
//!
//! 所有组件在这里按配置显式构造，不使用全局单例。

use std::sync::Arc;

use anyhow::{Context, Result};
use quant_cache_core::cache::RedisConnectionPool;
use quant_cache_core::config::CacheConfig;
use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::{ExpiryPolicy, KeyBuilder, StockPicksPage, StockPicksQuery};
use quant_cache_infrastructure::{
    FilePicksRepository, LocalTier, NegativeCache, RedisBitStore, RedisLeaseService,
    RedisSharedTier, RedisStreamEventSource, RedisStreamPublisher, TieredCacheStore,
};
use quant_cache_orchestration::WarmupJob;
use quant_cache_services::{
    ExistenceGuard, InvalidationListener, LeaseOptions, PartitionGenerations, ReadThroughCache,
    ReadThroughComponents, SingleflightCoordinator,
};
use tracing::{info, warn};

pub type PicksCache = ReadThroughCache<StockPicksQuery, StockPicksPage>;

/// 一个实例内的全部缓存组件
pub struct CacheRuntime {
    pub config: CacheConfig,
    pub pool: RedisConnectionPool,
    pub metrics: Arc<CacheMetrics>,
    pub keys: KeyBuilder,
    pub store: Arc<TieredCacheStore<StockPicksPage>>,
    pub negative: NegativeCache,
    pub guard: Arc<ExistenceGuard>,
    pub generations: PartitionGenerations,
    pub repository: Arc<FilePicksRepository>,
    pub cache: PicksCache,
}

impl CacheRuntime {
    pub async fn build(config: CacheConfig) -> Result<Self> {
        let pool = RedisConnectionPool::with_timeouts(&config.redis_url, config.redis_timeouts)
            .await
            .with_context(|| format!("连接 Redis 失败: {}", config.redis_url))?;
        let metrics = Arc::new(CacheMetrics::new());
        let keys = KeyBuilder::new(&config.keys.namespace, &config.keys.kind);

        let store = Arc::new(TieredCacheStore::new(
            LocalTier::new(config.local.max_entries, config.local.ttl),
            Arc::new(RedisSharedTier::new(pool.clone())),
            Arc::clone(&metrics),
        )
        .with_shared_timeout(config.redis_timeouts.response));
        let negative = NegativeCache::new(config.negative.max_entries, config.negative.ttl);
        let guard = Arc::new(
            ExistenceGuard::new(
                Arc::new(RedisBitStore::new(pool.clone(), &config.guard.key)),
                config.guard.max_offset_days,
            )
            .with_storage_timeout(config.redis_timeouts.response),
        );
        let coordinator = Arc::new(SingleflightCoordinator::new(
            Arc::new(RedisLeaseService::new(
                pool.clone(),
                config.lease.retry_interval,
            )),
            &config.lease.key_prefix,
            LeaseOptions::from(&config.lease),
            Arc::clone(&metrics),
        ));
        let repository = Arc::new(FilePicksRepository::new(&config.picks_data_dir));
        let generations = PartitionGenerations::new();

        let cache = ReadThroughCache::new(ReadThroughComponents {
            keys: keys.clone(),
            guard: Arc::clone(&guard),
            store: Arc::clone(&store),
            coordinator,
            loader: repository.clone(),
            negative: negative.clone(),
            expiry: ExpiryPolicy::new(
                config.expiry.shared_ttl,
                config.expiry.soft_expire_fraction,
                config.expiry.jitter_fraction,
            ),
            metrics: Arc::clone(&metrics),
            generations: generations.clone(),
        });

        info!(
            instance_id = %config.instance_id,
            namespace = %config.keys.namespace,
            kind = %config.keys.kind,
            "缓存组件装配完成"
        );
        Ok(Self {
            config,
            pool,
            metrics,
            keys,
            store,
            negative,
            guard,
            generations,
            repository,
            cache,
        })
    }

    /// 按数据目录重建存在性守卫；失败只告警，守卫在读写路径上会自愈
    pub async fn rebuild_guard(&self) -> usize {
        match self.guard.rebuild(self.repository.as_ref()).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "存在性守卫重建失败");
                0
            }
        }
    }

    /// 监听器与底层事件源；事件源留给关闭流程清理消费组
    pub async fn listener(
        &self,
    ) -> Result<(
        InvalidationListener<StockPicksPage>,
        Arc<RedisStreamEventSource>,
    )> {
        let invalidation = &self.config.invalidation;
        let source = RedisStreamEventSource::connect(
            self.pool.clone(),
            &invalidation.stream,
            &invalidation.group,
            &invalidation.consumer,
        )
        .await
        .context("订阅失效事件流失败")?;
        let source = Arc::new(source);

        let listener = InvalidationListener::new(
            source.clone(),
            Arc::clone(&self.store),
            self.negative.clone(),
            Arc::clone(&self.guard),
            self.generations.clone(),
            self.keys.clone(),
            Arc::clone(&self.metrics),
            invalidation.batch_size,
            invalidation.block,
        );
        Ok((listener, source))
    }

    pub fn publisher(&self) -> RedisStreamPublisher {
        RedisStreamPublisher::new(self.pool.clone(), &self.config.invalidation.stream)
    }

    pub fn warmup_job(&self) -> WarmupJob {
        WarmupJob::new(
            self.cache.clone(),
            self.repository.clone(),
            self.config.warmup.hot_key_set_size,
            self.config.warmup.page_size,
        )
    }
}
