//! # Quant Cache Domain
//!
//! 领域模型层 - 缓存协调所需的纯类型与端口定义，不依赖任何基础设施
//!
//! ## 模块组织
//!
//! - `entities`: 缓存条目、失效事件、选股结果
//! - `value_objects`: 缓存键及其构造器、交易日分区
//! - `traits`: 端口接口（共享缓存层、租约服务、位图存储、事件通道、数据加载）
//!
//! ## 使用示例
//!
//! ```rust
//! use quant_cache_domain::value_objects::{KeyBuilder, TradeDate};
//!
//! let builder = KeyBuilder::new("stable", "picks:daily");
//! let date: TradeDate = "2024-01-02".parse().unwrap();
//! let key = builder.build_key(&date, [None, None, Some("1"), Some("20")]);
//! assert_eq!(key.as_str(), "stable:picks:daily:2024-01-02:ALL:ALL:1:20");
//! ```

pub mod entities;
pub mod traits;
pub mod value_objects;

pub use entities::{
    now_millis, CacheEntry, CacheEntryError, EventError, ExpiryPolicy, Freshness,
    InvalidationEvent, StockPick, StockPicksPage, StockPicksQuery,
};
pub use traits::{
    BitStore, CacheQuery, Delivery, InvalidationEventSource, InvalidationPublisher, LeaseError,
    LeaseService, PartitionCatalog, QueryLoader, SharedCacheTier, TierError,
};
pub use value_objects::{CacheKey, KeyBuilder, TradeDate, TradeDateError};
