//! 内存事件通道
//!
//! 语义对齐 Redis Streams 消费组：每个组独立推进读位置，
//! 已投递未确认的条目留在组的待确认列表里，新订阅者会先收到它们。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use quant_cache_domain::{
    Delivery, InvalidationEvent, InvalidationEventSource, InvalidationPublisher, TierError,
};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct GroupState {
    /// 下一条未投递日志的下标
    next_index: usize,
    /// delivery_id -> (日志序号, payload)
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct State {
    log: Vec<(u64, String)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct InMemoryEventChannel {
    inner: Arc<Inner>,
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以消费组身份订阅；组不存在时从当前日志末尾开始
    pub fn subscribe(&self, group: &str) -> InMemoryEventSubscriber {
        if let Ok(mut state) = self.inner.state.lock() {
            let tail = state.log.len();
            state.groups.entry(group.to_string()).or_insert_with(|| GroupState {
                next_index: tail,
                pending: BTreeMap::new(),
            });
        }
        InMemoryEventSubscriber {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            backlog_drained: AtomicBool::new(false),
        }
    }

    /// 直接追加原始报文（用于构造格式错误的事件）
    pub fn push_raw(&self, payload: impl Into<String>) -> Result<String, TierError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner)?.log.push((id, payload.into()));
        self.inner.notify.notify_waiters();
        Ok(id.to_string())
    }

    /// 组内待确认条目数量
    pub fn pending_count(&self, group: &str) -> usize {
        lock(&self.inner)
            .ok()
            .and_then(|state| state.groups.get(group).map(|g| g.pending.len()))
            .unwrap_or(0)
    }
}

fn lock(inner: &Inner) -> Result<MutexGuard<'_, State>, TierError> {
    inner
        .state
        .lock()
        .map_err(|_| TierError::Unavailable("event channel poisoned".to_string()))
}

#[async_trait]
impl InvalidationPublisher for InMemoryEventChannel {
    async fn publish(&self, event: &InvalidationEvent) -> Result<String, TierError> {
        let payload = event
            .to_json()
            .map_err(|e| TierError::Serialization(e.to_string()))?;
        self.push_raw(payload)
    }
}

pub struct InMemoryEventSubscriber {
    inner: Arc<Inner>,
    group: String,
    backlog_drained: AtomicBool,
}

impl InMemoryEventSubscriber {
    fn take(&self, max: usize) -> Result<Vec<Delivery>, TierError> {
        let mut state = lock(&self.inner)?;
        let State { log, groups } = &mut *state;
        let group = groups.entry(self.group.clone()).or_default();

        if !self.backlog_drained.load(Ordering::Acquire) {
            if !group.pending.is_empty() {
                return Ok(group
                    .pending
                    .iter()
                    .take(max)
                    .map(|(id, payload)| Delivery {
                        delivery_id: id.to_string(),
                        payload: payload.clone(),
                    })
                    .collect());
            }
            self.backlog_drained.store(true, Ordering::Release);
        }

        let mut deliveries = Vec::new();
        while deliveries.len() < max && group.next_index < log.len() {
            let (id, payload) = &log[group.next_index];
            group.pending.insert(*id, payload.clone());
            deliveries.push(Delivery {
                delivery_id: id.to_string(),
                payload: payload.clone(),
            });
            group.next_index += 1;
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl InvalidationEventSource for InMemoryEventSubscriber {
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, TierError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.inner.notify.notified();
            let deliveries = self.take(max)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), TierError> {
        let id: u64 = delivery_id
            .parse()
            .map_err(|_| TierError::Serialization(format!("invalid delivery id {}", delivery_id)))?;
        let mut state = lock(&self.inner)?;
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.pending.remove(&id);
        }
        Ok(())
    }
}
