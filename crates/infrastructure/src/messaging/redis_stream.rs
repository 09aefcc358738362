//! Redis Streams 失效事件通道
//!
//! 每个进程使用独立的消费组，因此每条事件都会投递到每个进程（各自清理自己的 L1）；
//! 组内仍是 XREADGROUP + XACK 的至少一次语义。启动时先读本消费者的待确认条目（ID `0`），
//! 读空后再读新条目（ID `>`）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quant_cache_core::cache::RedisConnectionPool;
use quant_cache_domain::{
    Delivery, InvalidationEvent, InvalidationEventSource, InvalidationPublisher, TierError,
};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

const PAYLOAD_FIELD: &str = "payload";
const STREAM_MAXLEN: usize = 100_000;

fn unavailable(e: redis::RedisError) -> TierError {
    TierError::Unavailable(e.to_string())
}

pub struct RedisStreamEventSource {
    pool: RedisConnectionPool,
    /// 阻塞读独占的连接，避免阻塞共享连接上的其他命令
    reader: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    backlog_drained: AtomicBool,
}

impl RedisStreamEventSource {
    /// 连接并确保消费组存在
    pub async fn connect(
        pool: RedisConnectionPool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let reader = pool.dedicated_connection().await?;
        let source = Self {
            pool,
            reader,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            backlog_drained: AtomicBool::new(false),
        };
        source.ensure_group().await?;
        Ok(source)
    }

    async fn ensure_group(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.get_connection();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "创建失效事件消费组");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除本实例的消费组，组内未确认的条目随之丢弃
    pub async fn destroy_group(&self) -> anyhow::Result<bool> {
        let mut conn = self.pool.get_connection();
        let destroyed: i64 = conn.xgroup_destroy(&self.stream, &self.group).await?;
        info!(stream = %self.stream, group = %self.group, destroyed, "删除失效事件消费组");
        Ok(destroyed > 0)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn to_deliveries(reply: StreamReadReply) -> Vec<Delivery> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| {
                let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default();
                Delivery {
                    delivery_id: entry.id,
                    payload,
                }
            })
            .collect()
    }
}

#[async_trait]
impl InvalidationEventSource for RedisStreamEventSource {
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, TierError> {
        let mut conn = self.reader.clone();

        if !self.backlog_drained.load(Ordering::Acquire) {
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(max);
            let reply: StreamReadReply = conn
                .xread_options(&[&self.stream], &["0"], &opts)
                .await
                .map_err(unavailable)?;
            let pending = Self::to_deliveries(reply);
            if !pending.is_empty() {
                info!(stream = %self.stream, count = pending.len(), "重新处理待确认的失效事件");
                return Ok(pending);
            }
            self.backlog_drained.store(true, Ordering::Release);
        }

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(unavailable)?;
        Ok(reply.map(Self::to_deliveries).unwrap_or_default())
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), TierError> {
        let mut conn = self.pool.get_connection();
        let acked: i64 = conn
            .xack(&self.stream, &self.group, &[delivery_id])
            .await
            .map_err(unavailable)?;
        if acked == 0 {
            warn!(stream = %self.stream, delivery_id, "确认的条目不在待确认列表中");
        }
        Ok(())
    }
}

pub struct RedisStreamPublisher {
    pool: RedisConnectionPool,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(pool: RedisConnectionPool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl InvalidationPublisher for RedisStreamPublisher {
    async fn publish(&self, event: &InvalidationEvent) -> Result<String, TierError> {
        let payload = event
            .to_json()
            .map_err(|e| TierError::Serialization(e.to_string()))?;
        let mut conn = self.pool.get_connection();
        let id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await
            .map_err(unavailable)?;
        debug!(stream = %self.stream, id = %id, event_id = %event.event_id, "发布失效事件");
        Ok(id)
    }
}
