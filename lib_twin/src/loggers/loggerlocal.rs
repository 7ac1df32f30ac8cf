//! # Local Logger
//!
//! Installs the global `tracing` subscriber: an ANSI console layer plus a
//! JSON layer written to a daily rolling file through a non-blocking writer.
//!
//! The returned `WorkerGuard` flushes buffered lines when dropped, so the
//! caller keeps it alive for the life of the process.

use std::io;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::configs::config_twin::LoggingOptions;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Cannot create log directory: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid log filter {0:?}")]
    Filter(String),

    #[error("A global subscriber is already installed: {0}")]
    Init(String),
}

/// `RUST_LOG` wins over the configured level when set.
fn build_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| LoggerError::Filter(level.to_string()))
}

pub fn init_tracing(options: &LoggingOptions) -> Result<WorkerGuard, LoggerError> {
    std::fs::create_dir_all(&options.log_dir)?;

    let file_appender = rolling::daily(&options.log_dir, &options.file_name);
    let (writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer).json();

    tracing_subscriber::registry()
        .with(build_filter(&options.level)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    Ok(guard)
}
