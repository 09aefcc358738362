//! 值对象模块
//!
//! 值对象是不可变的、无身份标识的领域概念

pub mod cache_key;
pub mod trade_date;

pub use cache_key::{glob_escape, CacheKey, KeyBuilder, ALL_SENTINEL};
pub use trade_date::{TradeDate, TradeDateError};
