//! # Logging Setup
//!
//! Installs the global `tracing` subscriber used by the binaries:
//!
//! - an `EnvFilter` built from `RUST_LOG`, falling back to the configured level;
//! - a human-readable console layer with ANSI colors;
//! - a JSON layer writing to `<log_dir>/<app_name>.<date>`, rotated daily and
//!   written from a background thread.
//!
//! The returned `WorkerGuard` flushes the file writer when dropped, so the
//! caller keeps it alive for the life of the process.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("log directory unavailable: {0}")]
    Io(#[from] io::Error),
    #[error("invalid log filter '{level}': {source}")]
    Filter {
        level: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("global subscriber already set: {0}")]
    AlreadySet(#[from] tracing_subscriber::util::TryInitError),
}

pub fn setup_logging(
    log_dir: impl AsRef<Path>,
    level: &str,
    app_name: &str,
) -> Result<WorkerGuard, LoggingError> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, app_name);
    let (file_writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer).json();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
            level: level.to_string(),
            source,
        })?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(level, log_dir = %log_dir.display(), "logging initialized");
    Ok(guard)
}
