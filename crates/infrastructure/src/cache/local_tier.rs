//! 进程内 L1
//!
//! 基于 moka 的有界、带 TTL 的并发缓存；只做内存操作，从不等待网络。

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use quant_cache_domain::CacheEntry;

use super::pattern::{compile, matches};

pub struct LocalTier<V> {
    cache: Cache<String, Arc<CacheEntry<V>>>,
}

impl<V> Clone for LocalTier<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<V> LocalTier<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: &str, entry: Arc<CacheEntry<V>>) {
        self.cache.insert(key.to_string(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.cache.remove(key).is_some()
    }

    /// 按 glob 模式批量移除，返回移除数量
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let Some(pattern) = compile(pattern) else {
            return 0;
        };
        let matched: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| matches(&pattern, key))
            .map(|(key, _)| key)
            .collect();
        matched
            .iter()
            .filter(|key| self.cache.remove(key.as_str()).is_some())
            .count()
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(v: u32) -> Arc<CacheEntry<u32>> {
        Arc::new(CacheEntry::with_deadlines(v, 0, 1, 2).unwrap())
    }

    #[test]
    fn test_insert_get_remove() {
        let tier = LocalTier::new(100, Duration::from_secs(60));
        tier.insert("a", entry(1));
        assert_eq!(tier.get("a").map(|e| *e.value()), Some(1));
        assert!(tier.remove("a"));
        assert!(!tier.remove("a"));
        assert!(tier.get("a").is_none());
    }

    #[test]
    fn test_remove_matching() {
        let tier = LocalTier::new(100, Duration::from_secs(60));
        tier.insert("ns:k:2024-01-02:ALL", entry(1));
        tier.insert("ns:k:2024-01-02:macd", entry(2));
        tier.insert("ns:k:2024-01-03:ALL", entry(3));
        assert_eq!(tier.remove_matching("ns:k:2024-01-02:*"), 2);
        assert!(tier.get("ns:k:2024-01-03:ALL").is_some());
        assert_eq!(tier.entry_count(), 1);
    }

    #[test]
    fn test_remove_matching_treats_metacharacters_literally() {
        use quant_cache_domain::{KeyBuilder, TradeDate};

        let keys = KeyBuilder::new("stable", "picks:daily");
        let date = TradeDate::from_ymd(2024, 1, 2).unwrap();
        let starred: String = keys.build_key(&date, [Some("macd*")]).into();
        let other: String = keys.build_key(&date, [Some("macdx")]).into();

        let tier = LocalTier::new(100, Duration::from_secs(60));
        tier.insert(&starred, entry(1));
        tier.insert(&other, entry(2));
        let removed: usize = keys
            .invalidation_patterns(&date, Some("macd*"))
            .iter()
            .map(|pattern| tier.remove_matching(pattern))
            .sum();
        assert_eq!(removed, 1);
        assert!(tier.get(&other).is_some());
    }
}
