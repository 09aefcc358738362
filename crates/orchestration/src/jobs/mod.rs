//! 缓存任务

pub mod warmup_job;

pub use warmup_job::{WarmupJob, WarmupReport};
