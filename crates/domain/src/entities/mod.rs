//! 业务实体模块

pub mod cache_entry;
pub mod invalidation_event;
pub mod stock_picks;

pub use cache_entry::{now_millis, CacheEntry, CacheEntryError, ExpiryPolicy, Freshness};
pub use invalidation_event::{EventError, InvalidationEvent};
pub use stock_picks::{StockPick, StockPicksPage, StockPicksQuery};
