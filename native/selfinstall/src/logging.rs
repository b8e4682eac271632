use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOGS_DIR: &str = "logs";

/// Console verbosity for the number of `-v` flags
pub fn console_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Logs to stderr (filtered by `RUST_LOG`, or `verbosity`) and to a daily
/// rolling file under `app_dir/logs` at debug level.
///
/// The returned guard flushes the file writer when dropped.
pub fn setup_logging(app_dir: &Path, verbosity: u8) -> Result<WorkerGuard> {
    let logs_dir = app_dir.join(LOGS_DIR);
    fs_err::create_dir_all(&logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("selfinstall")
        .filename_suffix("log")
        .build(&logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level(verbosity).into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .event_format(fmt::format().pretty())
                .with_writer(non_blocking)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).with_filter(console_filter))
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
