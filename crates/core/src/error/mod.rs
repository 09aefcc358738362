//! 应用级错误
//!
//! 组件内部各自用 thiserror 定义细粒度错误；这里只覆盖启动装配阶段
//! （配置、Redis 连接）会遇到的错误，应用边界统一转成 anyhow。

pub use anyhow::{anyhow, Error as AnyhowError, Result};
pub use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("缓存错误: {0}")]
    CacheError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// 配置类错误在启动阶段直接退出，不做重试
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::ConfigError(_))
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;
