//! 预热定时调度
//!
//! 基于 tokio-cron-scheduler，按 cron 表达式（含秒字段）触发 `WarmupJob`。
//! 上一次预热尚未结束时跳过本次触发。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::jobs::{WarmupJob, WarmupReport};

pub struct WarmupScheduler {
    scheduler: JobScheduler,
    job: Arc<WarmupJob>,
    cron: String,
    running: Arc<AtomicBool>,
    started: bool,
}

impl WarmupScheduler {
    pub async fn new(job: Arc<WarmupJob>, cron: impl Into<String>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("创建调度器失败: {}", e))?;
        Ok(Self {
            scheduler,
            job,
            cron: cron.into(),
            running: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    /// 注册预热任务并启动调度
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        let job = Arc::clone(&self.job);
        let running = Arc::clone(&self.running);
        let cron_job = Job::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let job = Arc::clone(&job);
            let running = Arc::clone(&running);
            Box::pin(async move {
                run_exclusive(&job, &running).await;
            })
        })
        .map_err(|e| anyhow!("预热任务创建失败: cron={}, {}", self.cron, e))?;

        self.scheduler
            .add(cron_job)
            .await
            .map_err(|e| anyhow!("预热任务注册失败: {}", e))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| anyhow!("调度器启动失败: {}", e))?;
        self.started = true;
        info!(cron = %self.cron, "预热调度已启动");
        Ok(())
    }

    /// 立即执行一次预热（外部触发）
    pub async fn trigger_now(&self) -> Result<Option<WarmupReport>> {
        trigger_exclusive(&self.job, &self.running).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| anyhow!("调度器关闭失败: {}", e))?;
        self.started = false;
        info!("预热调度已停止");
        Ok(())
    }
}

/// 预热进行中标记；离开作用域（包括 panic 与取消）时清除
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        (!running.swap(true, Ordering::AcqRel)).then_some(Self(running))
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn trigger_exclusive(job: &WarmupJob, running: &AtomicBool) -> Result<Option<WarmupReport>> {
    let Some(_flag) = RunningFlag::acquire(running) else {
        debug!("预热正在进行，忽略本次手动触发");
        return Ok(None);
    };
    job.run().await.map(Some)
}

async fn run_exclusive(job: &WarmupJob, running: &AtomicBool) {
    let Some(_flag) = RunningFlag::acquire(running) else {
        warn!("上一次预热尚未结束，跳过本次触发");
        return;
    };
    if let Err(e) = job.run().await {
        error!(error = %e, "定时预热失败");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::warmup_job::tests::{picks_cache, seeded_repository};
    use async_trait::async_trait;
    use quant_cache_domain::{PartitionCatalog, TradeDate};
    use quant_cache_infrastructure::InMemorySharedTier;
    use std::time::Duration;

    struct PanickingCatalog;

    #[async_trait]
    impl PartitionCatalog for PanickingCatalog {
        async fn list_partitions(&self) -> anyhow::Result<Vec<TradeDate>> {
            panic!("catalog index corrupted");
        }
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seeded_repository(dir.path()).await;
        let shared = InMemorySharedTier::new();
        let job = Arc::new(WarmupJob::new(
            picks_cache(repository.clone(), &shared),
            repository,
            1,
            20,
        ));

        let mut scheduler = WarmupScheduler::new(job, "not a cron").await.unwrap();
        assert!(scheduler.start().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cron_trigger_warms_cache() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seeded_repository(dir.path()).await;
        let shared = InMemorySharedTier::new();
        let cache = picks_cache(repository.clone(), &shared);
        cache.guard().rebuild(repository.as_ref()).await.unwrap();
        let job = Arc::new(WarmupJob::new(cache, repository, 1, 20));

        let mut scheduler = WarmupScheduler::new(job, "*/1 * * * * *").await.unwrap();
        scheduler.start().await.unwrap();

        let key = "stable:picks:daily:2024-01-04:ALL:ALL:1:20";
        let mut warmed = false;
        for _ in 0..40 {
            if shared.contains(key) {
                warmed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        scheduler.shutdown().await.unwrap();
        assert!(warmed);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seeded_repository(dir.path()).await;
        let shared = InMemorySharedTier::new();
        let cache = picks_cache(repository.clone(), &shared);
        cache.guard().rebuild(repository.as_ref()).await.unwrap();
        let job = Arc::new(WarmupJob::new(cache, repository, 3, 20));

        let scheduler = WarmupScheduler::new(job, "0 50 8 * * *").await.unwrap();
        let report = scheduler.trigger_now().await.unwrap().unwrap();
        assert_eq!(report.computed, 3);
    }

    #[tokio::test]
    async fn test_panicking_run_clears_running_flag() {
        let dir = tempfile::tempdir().unwrap();
        let repository = seeded_repository(dir.path()).await;
        let shared = InMemorySharedTier::new();
        let job = Arc::new(WarmupJob::new(
            picks_cache(repository, &shared),
            Arc::new(PanickingCatalog),
            1,
            20,
        ));
        let running = Arc::new(AtomicBool::new(false));

        let crashed = {
            let job = Arc::clone(&job);
            let running = Arc::clone(&running);
            tokio::spawn(async move { trigger_exclusive(&job, &running).await })
        };
        assert!(crashed.await.unwrap_err().is_panic());
        assert!(!running.load(Ordering::Acquire));

        // 定时触发走同一个标记
        let crashed = {
            let job = Arc::clone(&job);
            let running = Arc::clone(&running);
            tokio::spawn(async move { run_exclusive(&job, &running).await })
        };
        assert!(crashed.await.unwrap_err().is_panic());
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn test_running_flag_is_exclusive() {
        let running = AtomicBool::new(false);
        let flag = RunningFlag::acquire(&running);
        assert!(flag.is_some());
        assert!(RunningFlag::acquire(&running).is_none());
        drop(flag);
        assert!(!running.load(Ordering::Acquire));
        assert!(RunningFlag::acquire(&running).is_some());
    }
}
