//! 失效事件通道接口

use std::time::Duration;

use async_trait::async_trait;

use super::cache_tier_trait::TierError;
use crate::entities::InvalidationEvent;

/// 一条待确认的投递
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// 通道内的投递标识，用于确认
    pub delivery_id: String,
    pub payload: String,
}

/// 至少一次语义的事件来源：未确认的投递会被重新投递
#[async_trait]
pub trait InvalidationEventSource: Send + Sync {
    /// 最多阻塞 `block`，返回至多 `max` 条投递
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, TierError>;

    async fn ack(&self, delivery_id: &str) -> Result<(), TierError>;
}

#[async_trait]
pub trait InvalidationPublisher: Send + Sync {
    /// 返回通道分配的消息标识
    async fn publish(&self, event: &InvalidationEvent) -> Result<String, TierError>;
}
