//! 空结果缓存
//!
//! 记住「数据源确认没有数据」的缓存键，短 TTL，只在本进程内生效，
//! 避免在共享层里写入空值造成缓存污染。

use std::time::Duration;

use moka::sync::Cache;

use super::pattern::{compile, matches};

#[derive(Clone)]
pub struct NegativeCache {
    cache: Cache<String, ()>,
}

impl NegativeCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn insert(&self, key: &str) {
        self.cache.insert(key.to_string(), ());
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let Some(pattern) = compile(pattern) else {
            return 0;
        };
        let matched: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| matches(&pattern, key))
            .map(|(key, _)| key)
            .collect();
        for key in &matched {
            self.cache.invalidate(key.as_str());
        }
        matched.len()
    }
}
