//! 配置管理模块

pub mod cache_config;
pub mod environment;
pub mod shutdown_manager;

// 重新导出
pub use cache_config::*;
pub use environment::*;
pub use shutdown_manager::{ShutdownConfig, ShutdownManager};
