use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// 关闭回调函数
pub type ShutdownHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// 关闭配置
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// 总超时时间
    pub total_timeout: Duration,
    /// 每个钩子的超时时间
    pub hook_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(10),
        }
    }
}

/// 优雅停止管理器
///
/// 钩子按注册顺序执行；单个钩子失败或超时不会中断后续钩子。
pub struct ShutdownManager {
    is_shutting_down: Arc<AtomicBool>,
    hooks: RwLock<Vec<(String, ShutdownHook)>>,
    config: ShutdownConfig,
}

impl ShutdownManager {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            hooks: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    /// 注册关闭回调
    pub async fn register_shutdown_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let boxed: ShutdownHook = Box::new(move || Box::pin(hook()));
        self.hooks.write().await.push((name.clone(), boxed));
        info!("注册关闭回调: {}", name);
    }

    /// 执行优雅关闭，返回成功完成的钩子数量
    pub async fn shutdown(&self) -> Result<usize> {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("关闭已在进行中");
            return Ok(0);
        }

        info!("开始执行优雅关闭，总超时: {:?}", self.config.total_timeout);
        let start = Instant::now();

        match tokio::time::timeout(self.config.total_timeout, self.run_hooks()).await {
            Ok(completed) => {
                info!("优雅关闭完成，耗时: {:?}", start.elapsed());
                Ok(completed)
            }
            Err(_) => {
                error!("关闭超时 ({:?})", self.config.total_timeout);
                Err(anyhow::anyhow!("关闭超时"))
            }
        }
    }

    async fn run_hooks(&self) -> usize {
        let hooks = self.hooks.read().await;
        let total = hooks.len();
        let mut completed = 0;

        for (index, (name, hook)) in hooks.iter().enumerate() {
            let hook_start = Instant::now();
            match tokio::time::timeout(self.config.hook_timeout, hook()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    info!(
                        "关闭回调 {}/{} [{}] 完成，耗时: {:?}",
                        index + 1,
                        total,
                        name,
                        hook_start.elapsed()
                    );
                }
                Ok(Err(e)) => {
                    error!("关闭回调 {}/{} [{}] 失败: {}", index + 1, total, name, e);
                }
                Err(_) => {
                    error!(
                        "关闭回调 {}/{} [{}] 超时 ({:?})",
                        index + 1,
                        total,
                        name,
                        self.config.hook_timeout
                    );
                }
            }
        }
        completed
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            Ok(name)
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            Ok("CTRL+C")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn failing_and_slow_hooks_do_not_stop_the_rest() {
        let manager = ShutdownManager::new(ShutdownConfig {
            total_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_millis(50),
        });
        let ran = Arc::new(AtomicUsize::new(0));

        manager
            .register_shutdown_hook("fails", || async { Err(anyhow::anyhow!("boom")) })
            .await;
        manager
            .register_shutdown_hook("slow", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        let counter = Arc::clone(&ran);
        manager
            .register_shutdown_hook("ok", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let completed = manager.shutdown().await.unwrap();
        assert_eq!(completed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(manager.is_shutting_down());
        // 第二次调用直接返回
        assert_eq!(manager.shutdown().await.unwrap(), 0);
    }
}
