//! 子命令实现

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quant_cache_core::config::{CacheConfig, ShutdownConfig, ShutdownManager};
use quant_cache_domain::{InvalidationEvent, InvalidationPublisher, StockPicksQuery, TradeDate};
use quant_cache_orchestration::WarmupScheduler;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::bootstrap::CacheRuntime;
use crate::{PublishArgs, QueryArgs};

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// 常驻服务：失效监听 + 定时预热 + 指标日志，收到信号后按顺序关闭
pub async fn serve(config: CacheConfig) -> Result<()> {
    let runtime = CacheRuntime::build(config).await?;
    let marked = runtime.rebuild_guard().await;
    info!(partitions = marked, "存在性守卫已就绪");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let (listener, source) = runtime.listener().await?;
    let listener = Arc::new(listener);
    let listener_handle = Arc::new(Mutex::new(Some(
        Arc::clone(&listener).spawn(shutdown_tx.subscribe()),
    )));

    let scheduler = if runtime.config.warmup.enabled {
        let mut scheduler =
            WarmupScheduler::new(Arc::new(runtime.warmup_job()), &runtime.config.warmup.cron)
                .await?;
        scheduler.start().await?;
        Some(Arc::new(Mutex::new(scheduler)))
    } else {
        info!("预热调度未启用");
        None
    };

    let reporter_handle = Arc::new(Mutex::new(Some(spawn_metrics_reporter(
        &runtime,
        shutdown_tx.subscribe(),
    ))));

    let signal = ShutdownManager::wait_for_shutdown_signal().await?;
    info!(signal, "收到关闭信号，开始优雅关闭");

    let manager = ShutdownManager::new(ShutdownConfig::default());
    {
        let shutdown_tx = shutdown_tx.clone();
        let handle = Arc::clone(&listener_handle);
        manager
            .register_shutdown_hook("invalidation_listener", move || {
                let shutdown_tx = shutdown_tx.clone();
                let handle = Arc::clone(&handle);
                async move {
                    let _ = shutdown_tx.send(());
                    if let Some(handle) = handle.lock().await.take() {
                        handle.await?;
                    }
                    Ok(())
                }
            })
            .await;
    }
    if runtime.config.invalidation.destroy_group_on_shutdown {
        // 必须排在监听器停止之后
        manager
            .register_shutdown_hook("invalidation_group", move || {
                let source = Arc::clone(&source);
                async move {
                    source.destroy_group().await?;
                    Ok(())
                }
            })
            .await;
    } else {
        info!(group = %source.group(), "保留消费组，重启后继续消费停机期间的事件");
    }
    if let Some(scheduler) = scheduler {
        manager
            .register_shutdown_hook("warmup_scheduler", move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    let mut scheduler = scheduler.lock().await;
                    scheduler.shutdown().await
                }
            })
            .await;
    }
    {
        let handle = Arc::clone(&reporter_handle);
        let metrics = Arc::clone(&runtime.metrics);
        manager
            .register_shutdown_hook("metrics_reporter", move || {
                let handle = Arc::clone(&handle);
                let metrics = Arc::clone(&metrics);
                async move {
                    if let Some(handle) = handle.lock().await.take() {
                        handle.await?;
                    }
                    info!(metrics = ?metrics.snapshot(), "最终缓存指标");
                    Ok(())
                }
            })
            .await;
    }

    let completed = manager.shutdown().await?;
    info!(completed, "优雅关闭完成");
    Ok(())
}

fn spawn_metrics_reporter(
    runtime: &CacheRuntime,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let metrics = Arc::clone(&runtime.metrics);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = metrics.snapshot();
                    info!(
                        hit_ratio = snapshot.hit_ratio,
                        l1_hits = snapshot.l1_hits,
                        l2_hits = snapshot.l2_hits,
                        misses = snapshot.misses,
                        computations = snapshot.computations,
                        fallbacks = snapshot.fallbacks,
                        evictions = snapshot.evictions,
                        "缓存指标"
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// 走一次完整的读穿流程并输出结果
pub async fn query(config: CacheConfig, args: QueryArgs) -> Result<()> {
    let runtime = CacheRuntime::build(config).await?;
    let date: TradeDate = args.date.parse().context("日期格式应为 YYYY-MM-DD")?;

    let mut query = StockPicksQuery::new(date).with_page(args.page, args.page_size);
    if let Some(strategy) = args.strategy {
        query = query.with_strategy(strategy);
    }
    if let Some(industry) = args.industry {
        query = query.with_industry(industry);
    }

    let key = runtime.cache.key_for(&query);
    let lookup = runtime.cache.get(&query).await?;
    let output = json!({
        "key": key,
        "outcome": lookup.label(),
        "value": lookup.value(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// 发布失效事件（写入方在数据落库后调用）
pub async fn publish(config: CacheConfig, args: PublishArgs) -> Result<()> {
    let runtime = CacheRuntime::build(config).await?;
    let date: TradeDate = args.date.parse().context("日期格式应为 YYYY-MM-DD")?;

    let event = InvalidationEvent::new(date, args.computation_id, args.version);
    let message_id = runtime.publisher().publish(&event).await?;
    // 本实例也立即标记分区，避免等待监听器
    runtime.guard.record_existing(&date).await;
    info!(event_id = %event.event_id, message_id = %message_id, "失效事件已发布");
    println!("{}", message_id);
    Ok(())
}

/// 立即预热一次
pub async fn warmup(config: CacheConfig) -> Result<()> {
    let runtime = CacheRuntime::build(config).await?;
    runtime.rebuild_guard().await;
    let report = runtime.warmup_job().run().await.map_err(|e| {
        error!(error = %e, "预热失败");
        e
    })?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
