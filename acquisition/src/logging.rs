//! Process-wide tracing setup for the `acquire` binary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::log_stream::{LogBroadcaster, LogChannelLayer};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Log file name for a session started at `started`
pub fn log_file_path(log_dir: &Path, started: DateTime<Utc>) -> PathBuf {
    log_dir.join(started.format("%Y%m%d-%H%M%S.log").to_string())
}

/// Install stderr, log file and UI channel layers.
///
/// `RUST_LOG` filters the stderr output; the log file records everything
/// at debug and above. Returns the log file path.
pub fn init_logging(log_dir: &Path, broadcaster: Arc<LogBroadcaster>) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_file_path(log_dir, Utc::now());
    let file = File::create(&path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(LogChannelLayer::new(broadcaster))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(path)
}
