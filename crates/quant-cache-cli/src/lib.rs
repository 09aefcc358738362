//! # Quant Cache CLI
//!
//! 选股结果分布式缓存的命令行入口

pub mod app;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use quant_cache_core::config::CacheConfig;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "quant-cache", version, about = "选股结果分布式缓存协调")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 常驻运行：失效监听、定时预热、指标日志
    Serve,
    /// 读取一次选股结果
    Query(QueryArgs),
    /// 发布失效事件
    Publish(PublishArgs),
    /// 立即预热热点键
    Warmup,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// 交易日，YYYY-MM-DD
    #[arg(long)]
    pub date: String,
    #[arg(long)]
    pub strategy: Option<String>,
    #[arg(long)]
    pub industry: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = 20)]
    pub page_size: u32,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    /// 交易日，YYYY-MM-DD
    #[arg(long)]
    pub date: String,
    /// 只失效某个计算（策略）的结果
    #[arg(long)]
    pub computation_id: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub version: i64,
}

/// 应用初始化：加载 .env、日志与配置
pub fn app_init() -> Result<CacheConfig> {
    dotenv().ok();
    quant_cache_core::logger::setup_logging()?;
    let config = CacheConfig::from_env()?;
    info!(instance_id = %config.instance_id, "应用初始化完成");
    Ok(config)
}

pub async fn run(cli: Cli, config: CacheConfig) -> Result<()> {
    match cli.command {
        Command::Serve => app::commands::serve(config).await,
        Command::Query(args) => app::commands::query(config, args).await,
        Command::Publish(args) => app::commands::publish(config, args).await,
        Command::Warmup => app::commands::warmup(config).await,
    }
}
