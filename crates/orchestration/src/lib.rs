//! # Quant Cache Orchestration
//!
//! 编排层：缓存预热任务与定时调度

pub mod jobs;
pub mod scheduler;

pub use jobs::{WarmupJob, WarmupReport};
pub use scheduler::WarmupScheduler;
