//! 消息传递：失效事件通道

pub mod memory_channel;
pub mod redis_stream;

pub use memory_channel::{InMemoryEventChannel, InMemoryEventSubscriber};
pub use redis_stream::{RedisStreamEventSource, RedisStreamPublisher};
