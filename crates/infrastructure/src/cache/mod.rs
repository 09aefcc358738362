//! 缓存层实现

pub mod local_tier;
pub mod memory_shared_tier;
pub mod negative_cache;
mod pattern;
pub mod redis_shared_tier;
pub mod tiered_store;

pub use local_tier::LocalTier;
pub use memory_shared_tier::InMemorySharedTier;
pub use negative_cache::NegativeCache;
pub use redis_shared_tier::RedisSharedTier;
pub use tiered_store::{TierHit, TieredCacheStore};
