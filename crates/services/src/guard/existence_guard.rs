//! 存在性守卫
//!
//! 以「自 1970-01-01 起的天数」为位偏移的单向位图：置位后永不清除。
//! - `might_exist` 返回 false：该分区一定没有数据，可直接短路
//! - 返回 true：不确定，按正常流程查询
//!
//! 存储不可用或超时未响应时一律放行（返回 true），宁可多查一次也不能把真实数据藏起来。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use quant_cache_domain::{BitStore, PartitionCatalog, TierError, TradeDate};
use tracing::{debug, info, warn};

pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ExistenceGuard {
    store: Arc<dyn BitStore>,
    max_offset: u64,
    storage_timeout: Duration,
    /// 已确认置位的偏移，只增不减
    marked: DashSet<u64>,
}

impl ExistenceGuard {
    pub fn new(store: Arc<dyn BitStore>, max_offset: u64) -> Self {
        Self {
            store,
            max_offset,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            marked: DashSet::new(),
        }
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    async fn get_bit(&self, offset: u64) -> Result<bool, TierError> {
        tokio::time::timeout(self.storage_timeout, self.store.get_bit(offset))
            .await
            .unwrap_or_else(|_| Err(TierError::Unavailable("guard read timed out".to_string())))
    }

    async fn set_bit(&self, offset: u64) -> Result<(), TierError> {
        tokio::time::timeout(self.storage_timeout, self.store.set_bit(offset))
            .await
            .unwrap_or_else(|_| Err(TierError::Unavailable("guard write timed out".to_string())))
    }

    fn offset_of(&self, partition: &TradeDate) -> Option<u64> {
        partition
            .epoch_offset()
            .filter(|offset| *offset <= self.max_offset)
    }

    pub async fn might_exist(&self, partition: &TradeDate) -> bool {
        // 超出可寻址范围的分区无法记录，只能放行
        let Some(offset) = self.offset_of(partition) else {
            return true;
        };
        if self.marked.contains(&offset) {
            return true;
        }
        match self.get_bit(offset).await {
            Ok(true) => {
                self.marked.insert(offset);
                true
            }
            Ok(false) => {
                debug!(partition = %partition, "守卫判定分区无数据");
                false
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "守卫存储不可用，放行");
                true
            }
        }
    }

    /// 幂等；存储写入失败时本进程内仍保持已置位
    pub async fn record_existing(&self, partition: &TradeDate) {
        let Some(offset) = self.offset_of(partition) else {
            warn!(partition = %partition, max_offset = self.max_offset, "分区超出守卫范围，忽略");
            return;
        };
        self.marked.insert(offset);
        if let Err(e) = self.set_bit(offset).await {
            warn!(partition = %partition, error = %e, "守卫置位失败");
        }
    }

    /// 按数据目录重建，用于守卫存储被重置后的自愈
    pub async fn rebuild(&self, catalog: &dyn PartitionCatalog) -> anyhow::Result<usize> {
        let partitions = catalog.list_partitions().await?;
        for partition in &partitions {
            self.record_existing(partition).await;
        }
        info!(count = partitions.len(), "存在性守卫重建完成");
        Ok(partitions.len())
    }
}
