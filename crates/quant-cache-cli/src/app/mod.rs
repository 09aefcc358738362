//! 应用层：启动装配与子命令

pub mod bootstrap;
pub mod commands;

pub use bootstrap::CacheRuntime;
