//! 分区失效代数
//!
//! 监听器在驱逐之前推进分区代数；读穿缓存在计算开始前记下代数，提交时比较。
//! 代数变化说明计算期间有失效事件落地，计算结果可能基于旧数据，不能写回缓存。

use std::sync::Arc;

use dashmap::DashMap;
use quant_cache_domain::TradeDate;

#[derive(Clone, Default)]
pub struct PartitionGenerations {
    inner: Arc<DashMap<TradeDate, u64>>,
}

impl PartitionGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, partition: &TradeDate) -> u64 {
        self.inner.get(partition).map_or(0, |g| *g)
    }

    /// 推进一代，返回新的代数
    pub fn advance(&self, partition: &TradeDate) -> u64 {
        let mut generation = self.inner.entry(*partition).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn has_moved(&self, partition: &TradeDate, observed: u64) -> bool {
        self.current(partition) != observed
    }
}
