//! Tracing subscriber setup.
//!
//! Every process logs to stderr. Worker processes additionally write a daily
//! rolling file into their workspace's `logs/` directory through a
//! non-blocking appender; the returned [`LogGuard`] must outlive the process
//! body or buffered lines are lost.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LoggingConfig;

/// Log file prefix inside a workspace `logs/` directory.
pub const LOG_FILE_PREFIX: &str = "dispatch.log";

/// Keeps the file appender's background writer alive.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn env_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(format!("dispatch={level},tower_http=info,warn"))
        .with_context(|| format!("Invalid log level '{}'", config.level))
}

/// Install the global subscriber. `log_dir` enables the rolling file layer.
pub fn init(config: &LoggingConfig, log_dir: Option<&Path>, verbose: bool) -> Result<LogGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.json {
        layers.push(stderr.json().boxed());
    } else {
        layers.push(stderr.boxed());
    }

    let mut guard = None;
    if let Some(dir) = log_dir.filter(|_| config.file) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(config, verbose)?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: guard })
}
