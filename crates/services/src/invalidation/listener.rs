//! 失效事件监听
//!
//! 至少一次消费：只有在驱逐完成后才确认投递，进程在驱逐中途崩溃时事件会被重新投递。
//! 驱逐是幂等的，重复投递无害。结构非法的事件确认后直接丢弃，重试也修不好它。

use std::sync::Arc;
use std::time::Duration;

use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::{
    Delivery, InvalidationEvent, InvalidationEventSource, KeyBuilder, TierError,
};
use quant_cache_infrastructure::{NegativeCache, TieredCacheStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PartitionGenerations;
use crate::guard::ExistenceGuard;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// 单条投递的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// 已驱逐，附带驱逐的键数量
    Evicted(usize),
    /// 结构非法，确认后丢弃
    Dropped,
}

pub struct InvalidationListener<V> {
    source: Arc<dyn InvalidationEventSource>,
    store: Arc<TieredCacheStore<V>>,
    negative: NegativeCache,
    guard: Arc<ExistenceGuard>,
    generations: PartitionGenerations,
    keys: KeyBuilder,
    metrics: Arc<CacheMetrics>,
    batch_size: usize,
    block: Duration,
}

impl<V> InvalidationListener<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn InvalidationEventSource>,
        store: Arc<TieredCacheStore<V>>,
        negative: NegativeCache,
        guard: Arc<ExistenceGuard>,
        generations: PartitionGenerations,
        keys: KeyBuilder,
        metrics: Arc<CacheMetrics>,
        batch_size: usize,
        block: Duration,
    ) -> Self {
        Self {
            source,
            store,
            negative,
            guard,
            generations,
            keys,
            metrics,
            batch_size: batch_size.max(1),
            block,
        }
    }

    /// 处理一条投递；返回错误表示驱逐未完成，不能确认
    pub async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, TierError> {
        let event = match InvalidationEvent::from_json(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_event_dropped();
                warn!(
                    delivery_id = %delivery.delivery_id,
                    error = %e,
                    "失效事件格式非法，丢弃"
                );
                return Ok(HandleOutcome::Dropped);
            }
        };

        // 先推进代数再驱逐，驱逐之后才提交的旧计算会被拒绝写入
        let generation = self.generations.advance(&event.partition);
        let patterns = self
            .keys
            .invalidation_patterns(&event.partition, event.computation_id.as_deref());
        let evicted = self.store.evict_matching(&patterns).await?;
        let negatives: usize = patterns
            .iter()
            .map(|pattern| self.negative.invalidate_matching(pattern))
            .sum();
        // 新数据落地意味着分区有数据
        self.guard.record_existing(&event.partition).await;
        self.metrics.record_event_processed();

        info!(
            event_id = %event.event_id,
            partition = %event.partition,
            computation_id = event.computation_id.as_deref().unwrap_or("*"),
            version = event.version,
            generation,
            evicted,
            negatives,
            "失效事件处理完成"
        );
        Ok(HandleOutcome::Evicted(evicted))
    }

    /// 处理一批投递，成功的立即确认；返回成功数量与需要重试的投递
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> (usize, Vec<Delivery>) {
        let mut processed = 0;
        let mut failed = Vec::new();
        for delivery in deliveries {
            match self.handle(&delivery).await {
                Ok(_) => {
                    processed += 1;
                    if let Err(e) = self.source.ack(&delivery.delivery_id).await {
                        // 未确认的事件会被重新投递，驱逐是幂等的
                        warn!(delivery_id = %delivery.delivery_id, error = %e, "确认投递失败");
                    }
                }
                Err(e) => {
                    error!(delivery_id = %delivery.delivery_id, error = %e, "驱逐失败，稍后重试");
                    failed.push(delivery);
                }
            }
        }
        (processed, failed)
    }

    /// 消费循环，收到关闭信号后退出
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(batch_size = self.batch_size, "失效监听启动");
        let mut retry: Vec<Delivery> = Vec::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if !retry.is_empty() {
                let (_, failed) = self.process_batch(std::mem::take(&mut retry)).await;
                retry = failed;
                if !retry.is_empty() {
                    debug!(pending = retry.len(), backoff_ms = backoff.as_millis() as u64, "等待重试");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                backoff = INITIAL_BACKOFF;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.source.poll(self.batch_size, self.block) => match polled {
                    Ok(deliveries) => {
                        backoff = INITIAL_BACKOFF;
                        if !deliveries.is_empty() {
                            let (_, failed) = self.process_batch(deliveries).await;
                            retry = failed;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, backoff_ms = backoff.as_millis() as u64, "拉取失效事件失败");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }

        if !retry.is_empty() {
            warn!(pending = retry.len(), "监听退出时仍有未完成的事件，将在重启后重新投递");
        }
        info!("失效监听已停止");
    }

    pub fn spawn(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
