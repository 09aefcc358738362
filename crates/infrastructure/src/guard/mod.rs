//! 存在性守卫的位图存储

pub mod memory_bit_store;
pub mod redis_bit_store;

pub use memory_bit_store::InMemoryBitStore;
pub use redis_bit_store::RedisBitStore;
