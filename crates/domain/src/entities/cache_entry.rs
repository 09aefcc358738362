//! 缓存条目
//!
//! 值与两条绝对截止时间（毫秒级 Unix 时间戳）一起存放：
//! - `soft_expire_at_ms` 之后仍可返回，但需要后台刷新
//! - `hard_expire_at_ms` 之后不可再用
//!
//! 跨进程共享的条目统一使用墙钟时间，保证各进程对新鲜度的判断一致。

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheEntryError {
    #[error("软过期时间必须早于硬过期时间: soft={soft}, hard={hard}")]
    InvalidDeadlines { soft: i64, hard: i64 },
}

/// 当前墙钟时间（毫秒）
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 条目新鲜度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// now <= soft
    Fresh,
    /// soft < now <= hard
    Stale,
    /// now > hard
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    value: T,
    created_at_ms: i64,
    soft_expire_at_ms: i64,
    hard_expire_at_ms: i64,
}

impl<T> CacheEntry<T> {
    /// 以显式截止时间创建条目
    pub fn with_deadlines(
        value: T,
        created_at_ms: i64,
        soft_expire_at_ms: i64,
        hard_expire_at_ms: i64,
    ) -> Result<Self, CacheEntryError> {
        if soft_expire_at_ms >= hard_expire_at_ms {
            return Err(CacheEntryError::InvalidDeadlines {
                soft: soft_expire_at_ms,
                hard: hard_expire_at_ms,
            });
        }
        Ok(Self {
            value,
            created_at_ms,
            soft_expire_at_ms,
            hard_expire_at_ms,
        })
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn soft_expire_at_ms(&self) -> i64 {
        self.soft_expire_at_ms
    }

    pub fn hard_expire_at_ms(&self) -> i64 {
        self.hard_expire_at_ms
    }

    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if now_ms > self.hard_expire_at_ms {
            Freshness::Expired
        } else if now_ms > self.soft_expire_at_ms {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// 距硬过期的剩余时间，已过期返回 0
    pub fn time_to_hard_expiry(&self, now_ms: i64) -> Duration {
        let remaining = self.hard_expire_at_ms.saturating_sub(now_ms).max(0);
        Duration::from_millis(remaining as u64)
    }

    /// 反序列化得到的条目不经过构造校验，读取时需要再确认一次
    pub fn is_well_formed(&self) -> bool {
        self.soft_expire_at_ms < self.hard_expire_at_ms
    }
}

/// 过期策略
///
/// 硬 TTL 在 `[ttl * (1 - jitter), ttl * (1 + jitter)]` 内均匀抖动，
/// 软过期点为抖动后 TTL 的 `soft_fraction` 处。
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryPolicy {
    pub ttl: Duration,
    pub soft_fraction: f64,
    pub jitter_fraction: f64,
}

impl ExpiryPolicy {
    pub fn new(ttl: Duration, soft_fraction: f64, jitter_fraction: f64) -> Self {
        Self {
            ttl,
            soft_fraction: soft_fraction.clamp(0.0, 1.0),
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// 随机抖动后的硬 TTL
    pub fn jittered_ttl(&self) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return self.ttl;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        self.ttl.mul_f64(factor)
    }

    /// 以当前时间为起点生成条目
    pub fn entry<T>(&self, value: T, now_ms: i64) -> CacheEntry<T> {
        self.entry_with_ttl(value, now_ms, self.jittered_ttl())
    }

    /// 指定 TTL 生成条目（不抖动）
    pub fn entry_with_ttl<T>(&self, value: T, now_ms: i64, ttl: Duration) -> CacheEntry<T> {
        // 至少 2ms，保证 soft 严格早于 hard
        let ttl_ms = (ttl.as_millis() as i64).max(2);
        let soft_ms = ((ttl_ms as f64 * self.soft_fraction) as i64).clamp(1, ttl_ms - 1);
        CacheEntry {
            value,
            created_at_ms: now_ms,
            soft_expire_at_ms: now_ms + soft_ms,
            hard_expire_at_ms: now_ms + ttl_ms,
        }
    }
}
