//! 缓存预热任务
//!
//! 在高峰前对热点键集合走一遍正常的读穿流程，让 L1/L2 提前就绪。
//! 热点键集合 = 最近 N 个有数据的交易日，每个交易日取首页汇总视图。

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use quant_cache_domain::{PartitionCatalog, StockPicksPage, StockPicksQuery};
use quant_cache_services::{Lookup, ReadThroughCache};
use serde::Serialize;
use tracing::{info, warn};

/// 一次预热的结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub requested: usize,
    /// 原本就在缓存里
    pub already_cached: usize,
    /// 本次重新计算写入
    pub computed: usize,
    pub absent: usize,
    pub degraded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

pub struct WarmupJob {
    cache: ReadThroughCache<StockPicksQuery, StockPicksPage>,
    catalog: Arc<dyn PartitionCatalog>,
    hot_key_set_size: usize,
    page_size: u32,
}

impl WarmupJob {
    pub fn new(
        cache: ReadThroughCache<StockPicksQuery, StockPicksPage>,
        catalog: Arc<dyn PartitionCatalog>,
        hot_key_set_size: usize,
        page_size: u32,
    ) -> Self {
        Self {
            cache,
            catalog,
            hot_key_set_size,
            page_size,
        }
    }

    /// 热点查询集合，最近的交易日在前
    pub async fn hot_queries(&self) -> Result<Vec<StockPicksQuery>> {
        let partitions = self.catalog.list_partitions().await?;
        Ok(partitions
            .into_iter()
            .rev()
            .take(self.hot_key_set_size)
            .map(|date| StockPicksQuery::new(date).with_page(1, self.page_size))
            .collect())
    }

    /// 执行一次预热；单个键失败只记录，不中断其余键
    pub async fn run(&self) -> Result<WarmupReport> {
        let started = Instant::now();
        let queries = self.hot_queries().await?;
        let mut report = WarmupReport {
            requested: queries.len(),
            ..WarmupReport::default()
        };

        for query in &queries {
            match self.cache.get(query).await {
                Ok(Lookup::Fresh(_)) | Ok(Lookup::Stale(_)) => report.already_cached += 1,
                Ok(Lookup::Computed(_)) => report.computed += 1,
                Ok(Lookup::Absent) => report.absent += 1,
                Ok(Lookup::Degraded(_)) => report.degraded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(trade_date = %query.trade_date, error = %e, "预热失败");
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            requested = report.requested,
            computed = report.computed,
            already_cached = report.already_cached,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "缓存预热完成"
        );
        Ok(report)
    }
}
