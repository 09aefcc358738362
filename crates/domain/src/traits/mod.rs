//! 领域接口模块
//!
//! 定义领域层的抽象接口，由基础设施层实现

pub mod cache_tier_trait;
pub mod event_trait;
pub mod lease_trait;
pub mod repository_trait;

pub use cache_tier_trait::{BitStore, SharedCacheTier, TierError};
pub use event_trait::{Delivery, InvalidationEventSource, InvalidationPublisher};
pub use lease_trait::{LeaseError, LeaseService};
pub use repository_trait::{CacheQuery, PartitionCatalog, QueryLoader};
