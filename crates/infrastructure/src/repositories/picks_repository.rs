//! 文件版选股数据源
//!
//! 每个交易日一个 JSON 文件: `{dir}/{YYYY-MM-DD}.json`，内容为 `Vec<StockPick>`。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use quant_cache_domain::{
    PartitionCatalog, QueryLoader, StockPick, StockPicksPage, StockPicksQuery, TradeDate,
};
use tracing::debug;

pub struct FilePicksRepository {
    dir: PathBuf,
}

impl FilePicksRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_path(&self, date: &TradeDate) -> PathBuf {
        self.dir.join(format!("{}.json", date))
    }

    /// 读取某个交易日的全部选股；文件不存在返回 None
    pub async fn read_partition(&self, date: &TradeDate) -> Result<Option<Vec<StockPick>>> {
        let path = self.partition_path(date);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("读取选股文件失败: {}", path.display())),
        };
        let picks: Vec<StockPick> = serde_json::from_slice(&raw)
            .with_context(|| format!("解析选股文件失败: {}", path.display()))?;
        Ok(Some(picks))
    }

    /// 覆盖写入某个交易日的选股（写入方使用）
    pub async fn save_partition(&self, date: &TradeDate, picks: &[StockPick]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("创建目录失败: {}", self.dir.display()))?;
        let path = self.partition_path(date);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(picks)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl QueryLoader<StockPicksQuery, StockPicksPage> for FilePicksRepository {
    async fn load(&self, query: &StockPicksQuery) -> Result<Option<StockPicksPage>> {
        debug!(trade_date = %query.trade_date, "从数据源加载选股");
        Ok(self
            .read_partition(&query.trade_date)
            .await?
            .and_then(|picks| query.apply(&picks)))
    }
}

#[async_trait]
impl PartitionCatalog for FilePicksRepository {
    async fn list_partitions(&self) -> Result<Vec<TradeDate>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut partitions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(date) = stem.parse::<TradeDate>() {
                partitions.push(date);
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}
