//! # promptloop-logging
//!
//! Logging for the promptloop improvement pipeline.
//!
//! ## Key Types
//!
//! - [`Logger`] - Structured pipeline event logging
//! - [`LogEvent`] - Pipeline milestone events
//! - [`LogFormat`] - Output formats (Pretty, JSON, Compact)
//!
//! Diagnostics go through `tracing`; [`init_tracing`] installs the
//! subscriber and, when given a directory, a daily rolling log file.

mod events;

pub use events::{LogEvent, LogFormat, Logger};

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directory for rolling log files and the event log.
///
/// `~/.local/share/promptloop/logs`
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptloop")
        .join("logs")
}

/// Initialize tracing for the application.
///
/// `RUST_LOG` overrides `level`. When `log_dir` is set, diagnostics are
/// also written as JSON to a daily rolling `promptloop.log` there; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init_tracing(level: &str, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "promptloop.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init(),
        LogFormat::Pretty | LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
    }

    guard
}
