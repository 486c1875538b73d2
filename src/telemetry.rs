//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LoggingSettings;

const LOG_FILE_PREFIX: &str = "docreview.log";

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .with_context(|| format!("Invalid log level '{}'", settings.level)),
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// and must be kept alive for the life of the process.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let console = if settings.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file, guard) = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(env_filter(settings)?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
