//! 两级缓存（L1 进程内 + L2 共享）
//!
//! 条目存储只归本结构所有。L2 的存储级 TTL 决定物理过期，
//! 条目内的 soft/hard 截止时间决定业务新鲜度，写入时保证 L2 TTL ≥ 距 hard 的剩余时间。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use quant_cache_core::metrics::CacheMetrics;
use quant_cache_domain::{now_millis, CacheEntry, SharedCacheTier, TierError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::local_tier::LocalTier;

/// 共享层单次调用的默认上限
pub const DEFAULT_SHARED_TIMEOUT: Duration = Duration::from_secs(1);

/// 命中所在层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierHit {
    Local,
    Shared,
}

pub struct TieredCacheStore<V> {
    local: LocalTier<V>,
    shared: Arc<dyn SharedCacheTier>,
    metrics: Arc<CacheMetrics>,
    shared_timeout: Duration,
}

impl<V> TieredCacheStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        local: LocalTier<V>,
        shared: Arc<dyn SharedCacheTier>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            local,
            shared,
            metrics,
            shared_timeout: DEFAULT_SHARED_TIMEOUT,
        }
    }

    /// 共享层卡住不响应时，超过该时长按不可用处理
    pub fn with_shared_timeout(mut self, timeout: Duration) -> Self {
        self.shared_timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, TierError>>,
    ) -> Result<T, TierError> {
        match tokio::time::timeout(self.shared_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TierError::Unavailable(format!(
                "shared tier {} timed out after {}ms",
                op,
                self.shared_timeout.as_millis()
            ))),
        }
    }

    /// 只查 L1
    pub fn get_local(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.local.get(key)
    }

    /// 只查 L2；格式不符的条目按未命中处理并顺手删除，L2 不可用同样按未命中处理
    pub async fn get_shared(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let bytes = match self.bounded("get", self.shared.get(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "读取共享缓存失败，按未命中处理");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry<V>>(&bytes) {
            Ok(entry) if entry.is_well_formed() => Some(Arc::new(entry)),
            Ok(_) => {
                self.discard_corrupt(key, "截止时间非法").await;
                None
            }
            Err(e) => {
                self.discard_corrupt(key, &e.to_string()).await;
                None
            }
        }
    }

    /// 先 L1 后 L2，L2 命中回填 L1
    pub async fn get(&self, key: &str) -> Option<(Arc<CacheEntry<V>>, TierHit)> {
        if let Some(entry) = self.get_local(key) {
            return Some((entry, TierHit::Local));
        }
        let entry = self.get_shared(key).await?;
        self.local.insert(key, Arc::clone(&entry));
        Some((entry, TierHit::Shared))
    }

    /// 写穿两级
    ///
    /// L1 总会写入；L2 写入失败时返回错误，由调用方决定是否只记录日志。
    pub async fn put(
        &self,
        key: &str,
        entry: impl Into<Arc<CacheEntry<V>>>,
        ttl: Duration,
    ) -> Result<(), TierError> {
        let entry = entry.into();
        let shared_ttl = ttl.max(entry.time_to_hard_expiry(now_millis()));
        self.local.insert(key, Arc::clone(&entry));

        let bytes = serde_json::to_vec(entry.as_ref())
            .map_err(|e| TierError::Serialization(e.to_string()))?;
        self.bounded("set", self.shared.set(key, bytes, shared_ttl)).await?;
        debug!(key = %key, ttl_ms = shared_ttl.as_millis() as u64, "缓存已写入两级");
        Ok(())
    }

    /// 只写 L1：值已在 L2 中是新鲜的，无需重复写共享层
    pub fn put_local_only(&self, key: &str, entry: Arc<CacheEntry<V>>) {
        self.local.insert(key, entry);
    }

    /// 两级都删除；任一层不存在该键都不算失败
    pub async fn evict(&self, key: &str) -> Result<(), TierError> {
        let local = self.local.remove(key);
        let shared = self.bounded("delete", self.shared.delete(key)).await?;
        if local || shared {
            self.metrics.record_evictions(1);
        }
        Ok(())
    }

    /// 按 glob 模式在两级中批量删除，返回删除的键数量（两层去重后）
    pub async fn evict_matching(&self, patterns: &[String]) -> Result<usize, TierError> {
        let mut removed = 0usize;
        for pattern in patterns {
            removed += self.local.remove_matching(pattern);
        }

        let mut shared_keys = Vec::new();
        for pattern in patterns {
            // 扫描可能分多页，只靠连接层的单命令超时限时
            shared_keys.extend(self.shared.keys_matching(pattern).await?);
        }
        shared_keys.sort();
        shared_keys.dedup();
        for key in &shared_keys {
            // 扫描与删除之间写入的新值也一并删除，读路径会重新计算
            if self.bounded("delete", self.shared.delete(key)).await? {
                removed += 1;
            }
            self.local.remove(key);
        }

        self.metrics.record_evictions(removed as u64);
        Ok(removed)
    }

    async fn discard_corrupt(&self, key: &str, reason: &str) {
        self.metrics.record_corrupt_entry();
        warn!(key = %key, reason = %reason, "共享缓存条目格式不符，删除");
        if let Err(e) = self.bounded("delete", self.shared.delete(key)).await {
            warn!(key = %key, error = %e, "删除损坏条目失败");
        }
        self.local.remove(key);
    }
}
