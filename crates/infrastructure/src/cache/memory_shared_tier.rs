//! 内存版共享缓存层
//!
//! 克隆出的句柄共享同一份数据，可在测试里模拟多个进程共用一个 L2。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use quant_cache_domain::{SharedCacheTier, TierError};
use tokio::time::Instant;

use super::pattern::{compile, matches};

#[derive(Default)]
struct Inner {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemorySharedTier {
    inner: Arc<Inner>,
}

impl InMemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟网络故障
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 累计读取次数
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// 累计写入次数
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .map_or(false, |e| e.1 > Instant::now())
    }

    /// 剩余 TTL
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.inner
            .entries
            .get(key)
            .map(|e| e.1.saturating_duration_since(Instant::now()))
    }

    /// 绕过序列化直接写入原始字节
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.inner
            .entries
            .insert(key.to_string(), (bytes, Instant::now() + ttl));
    }

    fn check(&self) -> Result<(), TierError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable("in-memory tier offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedCacheTier for InMemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.check()?;
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let expired = match self.inner.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.inner.entries.remove_if(key, |_, v| v.1 <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), TierError> {
        self.check()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        self.check()?;
        Ok(self.inner.entries.remove(key).is_some())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, TierError> {
        self.check()?;
        let Some(pattern) = compile(pattern) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().1 > now && matches(&pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
