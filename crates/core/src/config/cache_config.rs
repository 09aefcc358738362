//! 缓存协调层配置
//!
//! 所有配置均来自环境变量（可由 `.env` 加载），缺省值见各字段注释。

use std::time::Duration;

use tracing::warn;

use crate::cache::RedisTimeouts;
use crate::config::environment::{
    env_duration_ms, env_duration_secs, env_f64, env_is_true, env_or_default, env_u64,
};
use crate::error::{AppError, AppResult};

/// 缓存键命名
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// 命名空间前缀（CACHE_NAMESPACE，默认 stable）
    pub namespace: String,
    /// 业务类型（CACHE_KIND，默认 picks:daily）
    pub kind: String,
}

/// 进程内 L1
#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    pub max_entries: u64,
    pub ttl: Duration,
}

/// 过期策略：硬过期 TTL、软过期比例、TTL 随机抖动
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub shared_ttl: Duration,
    pub soft_expire_fraction: f64,
    pub jitter_fraction: f64,
}

/// 空结果缓存
#[derive(Debug, Clone)]
pub struct NegativeCacheConfig {
    pub ttl: Duration,
    pub max_entries: u64,
}

/// 分布式租约与本地等待
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub key_prefix: String,
    /// 获取租约的最长等待
    pub wait_timeout: Duration,
    /// 租约时长，持有者崩溃后到期自动释放
    pub lease_duration: Duration,
    /// 抢占租约的轮询间隔
    pub retry_interval: Duration,
    /// 本地等待结果的最长时间
    pub local_wait_timeout: Duration,
}

/// 存在性守卫
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub key: String,
    /// 可寻址的最大天数偏移（自 1970-01-01 起）
    pub max_offset_days: u64,
}

/// 失效事件消费
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    /// 关闭时删除本实例的消费组；实例标识是随机生成时默认开启，重启后不会再用到这个组
    pub destroy_group_on_shutdown: bool,
}

/// 预热任务
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub cron: String,
    pub hot_key_set_size: usize,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub redis_timeouts: RedisTimeouts,
    /// 决定消费组名；重启后沿用同一标识才能接着消费停机期间的事件
    pub instance_id: String,
    pub keys: KeyConfig,
    pub local: LocalTierConfig,
    pub expiry: ExpiryConfig,
    pub negative: NegativeCacheConfig,
    pub lease: LeaseConfig,
    pub guard: GuardConfig,
    pub invalidation: InvalidationConfig,
    pub warmup: WarmupConfig,
    pub picks_data_dir: String,
}

/// 实例标识：INSTANCE_ID → 主机名 → 随机 UUID，返回值第二项表示是否为随机生成
pub fn resolve_instance_id(explicit: Option<String>) -> (String, bool) {
    let stable = explicit
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        });
    match stable {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let (instance_id, ephemeral) = resolve_instance_id(None);
        let namespace = "stable".to_string();
        let kind = "picks:daily".to_string();
        Self {
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            redis_timeouts: RedisTimeouts::default(),
            keys: KeyConfig {
                namespace: namespace.clone(),
                kind: kind.clone(),
            },
            local: LocalTierConfig {
                max_entries: 10_000,
                ttl: Duration::from_secs(60),
            },
            expiry: ExpiryConfig {
                shared_ttl: Duration::from_secs(300),
                soft_expire_fraction: 0.5,
                jitter_fraction: 0.1,
            },
            negative: NegativeCacheConfig {
                ttl: Duration::from_secs(30),
                max_entries: 10_000,
            },
            lease: LeaseConfig {
                key_prefix: "lock".to_string(),
                wait_timeout: Duration::from_millis(3_000),
                lease_duration: Duration::from_millis(30_000),
                retry_interval: Duration::from_millis(50),
                local_wait_timeout: Duration::from_millis(10_000),
            },
            guard: GuardConfig {
                key: format!("{}:guard:{}", namespace, kind),
                max_offset_days: 73_050,
            },
            invalidation: InvalidationConfig {
                stream: "cache:invalidation".to_string(),
                group: format!("cache-invalidator-{}", instance_id),
                consumer: instance_id.clone(),
                batch_size: 64,
                block: Duration::from_millis(5_000),
                destroy_group_on_shutdown: ephemeral,
            },
            warmup: WarmupConfig {
                enabled: true,
                cron: "0 50 8 * * *".to_string(),
                hot_key_set_size: 5,
                page_size: 20,
            },
            picks_data_dir: "data/picks".to_string(),
            instance_id,
        }
    }
}

impl CacheConfig {
    /// 从环境变量加载并校验
    pub fn from_env() -> AppResult<Self> {
        let d = Self::default();

        let (instance_id, ephemeral) = resolve_instance_id(std::env::var("INSTANCE_ID").ok());
        if ephemeral {
            warn!(instance_id = %instance_id, "未设置 INSTANCE_ID 且无法读取主机名，使用随机标识");
        }
        let namespace = env_or_default("CACHE_NAMESPACE", &d.keys.namespace);
        let kind = env_or_default("CACHE_KIND", &d.keys.kind);
        let default_guard_key = format!("{}:guard:{}", namespace, kind);
        let default_group = format!("cache-invalidator-{}", instance_id);

        let config = Self {
            redis_url: env_or_default("REDIS_HOST", &d.redis_url),
            redis_timeouts: RedisTimeouts {
                response: env_duration_ms(
                    "REDIS_RESPONSE_TIMEOUT_MS",
                    d.redis_timeouts.response.as_millis() as u64,
                ),
                connect: env_duration_ms(
                    "REDIS_CONNECT_TIMEOUT_MS",
                    d.redis_timeouts.connect.as_millis() as u64,
                ),
            },
            keys: KeyConfig { namespace, kind },
            local: LocalTierConfig {
                max_entries: env_u64("CACHE_L1_MAX_ENTRIES", d.local.max_entries),
                ttl: env_duration_secs("CACHE_L1_TTL_SECS", d.local.ttl.as_secs()),
            },
            expiry: ExpiryConfig {
                shared_ttl: env_duration_secs("CACHE_L2_TTL_SECS", d.expiry.shared_ttl.as_secs()),
                soft_expire_fraction: env_f64(
                    "CACHE_SOFT_EXPIRE_FRACTION",
                    d.expiry.soft_expire_fraction,
                ),
                jitter_fraction: env_f64("CACHE_TTL_JITTER_FRACTION", d.expiry.jitter_fraction),
            },
            negative: NegativeCacheConfig {
                ttl: env_duration_secs("CACHE_NEGATIVE_TTL_SECS", d.negative.ttl.as_secs()),
                max_entries: env_u64("CACHE_NEGATIVE_MAX_ENTRIES", d.negative.max_entries),
            },
            lease: LeaseConfig {
                key_prefix: env_or_default("LEASE_KEY_PREFIX", &d.lease.key_prefix),
                wait_timeout: env_duration_ms("LEASE_WAIT_MS", 3_000),
                lease_duration: env_duration_ms("LEASE_DURATION_MS", 30_000),
                retry_interval: env_duration_ms("LEASE_RETRY_INTERVAL_MS", 50),
                local_wait_timeout: env_duration_ms("LOCAL_WAIT_MS", 10_000),
            },
            guard: GuardConfig {
                key: env_or_default("GUARD_KEY", &default_guard_key),
                max_offset_days: env_u64("GUARD_MAX_OFFSET_DAYS", d.guard.max_offset_days),
            },
            invalidation: InvalidationConfig {
                stream: env_or_default("INVALIDATION_STREAM", &d.invalidation.stream),
                group: env_or_default("INVALIDATION_GROUP", &default_group),
                consumer: instance_id.clone(),
                batch_size: env_u64("INVALIDATION_BATCH_SIZE", 64) as usize,
                block: env_duration_ms("INVALIDATION_BLOCK_MS", 5_000),
                destroy_group_on_shutdown: env_is_true("INVALIDATION_DESTROY_GROUP", ephemeral),
            },
            warmup: WarmupConfig {
                enabled: env_is_true("WARMUP_ENABLED", true),
                cron: env_or_default("WARMUP_CRON", &d.warmup.cron),
                hot_key_set_size: env_u64("HOT_KEY_SET_SIZE", 5) as usize,
                page_size: env_u64("WARMUP_PAGE_SIZE", 20) as u32,
            },
            picks_data_dir: env_or_default("PICKS_DATA_DIR", &d.picks_data_dir),
            instance_id,
        };

        config.validate()?;
        Ok(config)
    }

    /// 校验：所有等待必须有限且非零，软过期比例在 (0,1) 内
    pub fn validate(&self) -> AppResult<()> {
        let durations = [
            ("CACHE_L1_TTL_SECS", self.local.ttl),
            ("CACHE_L2_TTL_SECS", self.expiry.shared_ttl),
            ("CACHE_NEGATIVE_TTL_SECS", self.negative.ttl),
            ("LEASE_WAIT_MS", self.lease.wait_timeout),
            ("LEASE_DURATION_MS", self.lease.lease_duration),
            ("LEASE_RETRY_INTERVAL_MS", self.lease.retry_interval),
            ("LOCAL_WAIT_MS", self.lease.local_wait_timeout),
            ("INVALIDATION_BLOCK_MS", self.invalidation.block),
            ("REDIS_RESPONSE_TIMEOUT_MS", self.redis_timeouts.response),
            ("REDIS_CONNECT_TIMEOUT_MS", self.redis_timeouts.connect),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(AppError::ConfigError(format!("{} must be greater than 0", name)));
            }
        }

        let fraction = self.expiry.soft_expire_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(AppError::ConfigError(format!(
                "CACHE_SOFT_EXPIRE_FRACTION must be in (0, 1), got {}",
                fraction
            )));
        }
        let jitter = self.expiry.jitter_fraction;
        if !(0.0..0.5).contains(&jitter) {
            return Err(AppError::ConfigError(format!(
                "CACHE_TTL_JITTER_FRACTION must be in [0, 0.5), got {}",
                jitter
            )));
        }
        if self.lease.local_wait_timeout < self.lease.wait_timeout {
            return Err(AppError::ConfigError(
                "LOCAL_WAIT_MS must not be shorter than LEASE_WAIT_MS".to_string(),
            ));
        }
        if self.expiry.shared_ttl < self.local.ttl {
            return Err(AppError::ConfigError(
                "CACHE_L2_TTL_SECS must not be shorter than CACHE_L1_TTL_SECS".to_string(),
            ));
        }
        if self.local.max_entries == 0 {
            return Err(AppError::ConfigError(
                "CACHE_L1_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }
        if self.invalidation.batch_size == 0 || self.warmup.hot_key_set_size == 0 {
            return Err(AppError::ConfigError(
                "INVALIDATION_BATCH_SIZE and HOT_KEY_SET_SIZE must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
