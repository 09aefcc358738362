//! 内存位图
//!
//! 以 `RoaringBitmap` 存储分区偏移，稀疏的日期集合只占很少内存。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use quant_cache_domain::{BitStore, TierError};
use roaring::RoaringBitmap;

#[derive(Default)]
struct Inner {
    bits: RwLock<RoaringBitmap>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemoryBitStore {
    inner: Arc<Inner>,
}

impl InMemoryBitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 累计 get_bit 次数
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// 已置位的数量
    pub fn len(&self) -> u64 {
        self.inner.bits.read().map_or(0, |bits| bits.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), TierError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable("in-memory bitmap offline".to_string()));
        }
        Ok(())
    }

    fn lock_error() -> TierError {
        TierError::Unavailable("bitmap lock poisoned".to_string())
    }
}

fn to_index(offset: u64) -> Result<u32, TierError> {
    u32::try_from(offset)
        .map_err(|_| TierError::Unavailable(format!("bitmap offset out of range: {}", offset)))
}

#[async_trait]
impl BitStore for InMemoryBitStore {
    async fn get_bit(&self, offset: u64) -> Result<bool, TierError> {
        self.check()?;
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let index = to_index(offset)?;
        let bits = self.inner.bits.read().map_err(|_| Self::lock_error())?;
        Ok(bits.contains(index))
    }

    async fn set_bit(&self, offset: u64) -> Result<(), TierError> {
        self.check()?;
        let index = to_index(offset)?;
        let mut bits = self.inner.bits.write().map_err(|_| Self::lock_error())?;
        bits.insert(index);
        Ok(())
    }
}
