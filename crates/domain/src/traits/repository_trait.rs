//! 数据源接口 - 缓存背后的唯一事实来源

use async_trait::async_trait;
use anyhow::Result;

use crate::value_objects::TradeDate;

/// 可缓存的查询：一个分区维度加按固定顺序声明的过滤维度
pub trait CacheQuery: Send + Sync {
    fn partition(&self) -> TradeDate;

    fn filters(&self) -> Vec<Option<String>>;
}

/// 昂贵的加载/计算
#[async_trait]
pub trait QueryLoader<Q, V>: Send + Sync
where
    Q: Send + Sync,
{
    /// `Ok(None)` 表示数据源中确实没有该查询的数据
    async fn load(&self, query: &Q) -> Result<Option<V>>;
}

/// 已有数据的分区目录
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// 升序返回所有已有数据的分区
    async fn list_partitions(&self) -> Result<Vec<TradeDate>>;
}
