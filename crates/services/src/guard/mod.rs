//! 缓存穿透防护

pub mod existence_guard;

pub use existence_guard::ExistenceGuard;
