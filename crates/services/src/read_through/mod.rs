//! 读穿缓存

mod read_through_cache;

pub use read_through_cache::{Lookup, ReadThroughCache, ReadThroughComponents, Resolved};
