//! # Quant Cache Services
//!
//! 应用服务层 - 把领域端口与基础设施适配器组合成缓存协调流程
//!
//! ## 职责
//!
//! 1. **穿透防护**: `ExistenceGuard` 以分区位图短路必然为空的查询
//! 2. **单飞协调**: `SingleflightCoordinator` 保证同一计算键集群内同一时刻至多一次计算
//! 3. **读穿缓存**: `ReadThroughCache` 实现 L1 → L2 → 重新计算的读取流程与软过期后台刷新
//! 4. **失效监听**: `InvalidationListener` 消费失效事件并驱逐受影响的键
//!
//! ## 架构位置
//!
//! ```text
//! orchestration (预热调度) → services (缓存协调) → domain + infrastructure
//! ```
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use quant_cache_domain::{StockPicksQuery, TradeDate};
//!
//! let query = StockPicksQuery::new("2024-01-02".parse::<TradeDate>()?).with_strategy("macd");
//! let lookup = cache.get(&query).await?;
//! if let Some(page) = lookup.value() {
//!     println!("{} picks", page.total);
//! }
//! ```

pub mod guard;
pub mod invalidation;
pub mod read_through;
pub mod singleflight;

pub use guard::ExistenceGuard;
pub use invalidation::{HandleOutcome, InvalidationListener, PartitionGenerations};
pub use read_through::{Lookup, ReadThroughCache, ReadThroughComponents, Resolved};
pub use singleflight::{
    FlightOrigin, FlightResult, LeaseOptions, SingleflightCoordinator, SingleflightError,
};
