//! 集群租约实现

pub mod memory_lease;
pub mod redis_lease;

pub use memory_lease::InMemoryLeaseService;
pub use redis_lease::RedisLeaseService;
