//! # Quant Cache Infrastructure
//!
//! 基础设施层 - 实现领域层定义的端口
//!
//! ## 职责
//!
//! 1. **缓存**: moka 进程内 L1、Redis/内存共享 L2、两级缓存存储、空结果缓存
//! 2. **存在性守卫存储**: Redis 位图与内存位图
//! 3. **租约**: Redis `SET NX PX` 租约与内存租约
//! 4. **消息传递**: Redis Streams 与内存事件通道
//! 5. **数据源**: 文件版选股数据
//!
//! 每个 Redis 实现都有对应的内存实现，测试中可以不依赖外部服务拼出完整链路。

pub mod cache;
pub mod guard;
pub mod lock;
pub mod messaging;
pub mod repositories;

pub use cache::{
    InMemorySharedTier, LocalTier, NegativeCache, RedisSharedTier, TierHit, TieredCacheStore,
};
pub use guard::{InMemoryBitStore, RedisBitStore};
pub use lock::{InMemoryLeaseService, RedisLeaseService};
pub use messaging::{
    InMemoryEventChannel, InMemoryEventSubscriber, RedisStreamEventSource, RedisStreamPublisher,
};
pub use repositories::FilePicksRepository;
