//! # Quant Cache Core
//!
//! 核心基础设施：配置、Redis 连接、错误、日志、缓存指标

pub mod cache;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
