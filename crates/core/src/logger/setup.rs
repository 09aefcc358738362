use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{env_is_true, env_or_default};

// 文件写入线程需要活到进程结束
static INFO_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static ERROR_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone)]
struct LogSettings {
    app_env: String,
    level: String,
    dir: String,
    rotation: Rotation,
    info_file: String,
    error_file: String,
    console: bool,
    /// 文件日志输出 JSON（便于采集）
    json: bool,
}

impl LogSettings {
    fn from_env() -> Self {
        Self {
            app_env: env_or_default("APP_ENV", "local"),
            level: env_or_default("LOG_LEVEL", "info"),
            dir: env_or_default("LOG_DIR", "log_files"),
            rotation: parse_rotation(&env_or_default("LOG_ROTATION", "daily")),
            info_file: env_or_default("LOG_INFO_FILE", "quant-cache.log"),
            error_file: env_or_default("LOG_ERROR_FILE", "quant-cache-error.log"),
            console: env_is_true("ENABLE_CONSOLE_LOGGING", true),
            json: env_or_default("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
        }
    }

    fn is_local(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("local")
    }
}

fn parse_rotation(s: &str) -> Rotation {
    match s.to_lowercase().as_str() {
        "minutely" | "minute" | "min" => Rotation::MINUTELY,
        "hourly" | "hour" | "hr" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

fn file_layer<S>(
    writer: NonBlocking,
    filter: EnvFilter,
    json: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(writer);
    if json {
        layer.json().with_filter(filter).boxed()
    } else {
        layer
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed()
    }
}

/// 初始化全局日志
///
/// `APP_ENV=local` 时只输出到控制台；其他环境写滚动文件（普通日志 + 错误日志），
/// `ENABLE_CONSOLE_LOGGING` 控制是否同时输出控制台。
pub fn setup_logging() -> anyhow::Result<()> {
    let settings = LogSettings::from_env();

    if settings.is_local() {
        let subscriber = Registry::default().with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_writer(std::io::stdout)
                .with_filter(EnvFilter::new(&settings.level)),
        );
        tracing::subscriber::set_global_default(subscriber)?;
        info!(env = %settings.app_env, level = %settings.level, "日志初始化完成");
        return Ok(());
    }

    std::fs::create_dir_all(&settings.dir)
        .with_context(|| format!("创建日志目录失败: {}", settings.dir))?;

    let (info_writer, info_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        settings.rotation.clone(),
        &settings.dir,
        &settings.info_file,
    ));
    let (error_writer, error_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        settings.rotation.clone(),
        &settings.dir,
        &settings.error_file,
    ));
    INFO_GUARD
        .set(info_guard)
        .map_err(|_| anyhow!("日志已经初始化过"))?;
    ERROR_GUARD
        .set(error_guard)
        .map_err(|_| anyhow!("日志已经初始化过"))?;

    let console = settings.console.then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(std::io::stdout)
            .with_filter(EnvFilter::new(&settings.level))
    });

    let subscriber = Registry::default()
        .with(file_layer(
            info_writer,
            EnvFilter::new(&settings.level),
            settings.json,
        ))
        .with(file_layer(error_writer, EnvFilter::new("error"), settings.json))
        .with(console);
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        env = %settings.app_env,
        level = %settings.level,
        dir = %settings.dir,
        console = settings.console,
        json = settings.json,
        "日志初始化完成"
    );
    Ok(())
}
