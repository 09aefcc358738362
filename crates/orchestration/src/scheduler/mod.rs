//! 调度器模块

pub mod warmup_scheduler;

pub use warmup_scheduler::WarmupScheduler;
