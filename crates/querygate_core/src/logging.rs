//! Logging for the engine.
//!
//! Every execution runs inside an `execution` span carrying its id, so the
//! driver, pool and sandbox events it causes can be correlated without each
//! call site repeating the id.
//!
//! Embedding services usually own the global subscriber; `init_logging`
//! only installs one when none is set. Standalone use gets stdout plus an
//! optional daily rotating file, filtered by `[logging] filter`,
//! `QUERYGATE_LOG` or `RUST_LOG` in that order.

use std::path::PathBuf;

use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;
use crate::models::ExecutionRequest;

/// Environment variable holding a log filter directive.
pub const LOG_ENV: &str = "QUERYGATE_LOG";

/// Span covering one execution attempt.
///
/// `instance_id` is empty when the request carries no connection info; such
/// requests are rejected before anything is logged inside the span.
pub fn execution_span(request: &ExecutionRequest) -> Span {
    let span = tracing::info_span!(
        "execution",
        execution_id = %request.id,
        submission_type = ?request.submission_type,
        database_type = %request.database_type,
        instance_id = tracing::field::Empty,
    );
    if let Some(info) = &request.instance_connection_info {
        span.record("instance_id", tracing::field::display(info.id));
    }
    span
}

/// Flushes the file writer when dropped. Hold it for the life of the process.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install a subscriber for `settings`, unless one is already set.
///
/// Interactive terminals log to stdout only. Otherwise events also go to a
/// daily file under `settings.directory`; if that directory is unusable the
/// file is skipped with a warning on stderr.
pub fn init_logging(settings: &LoggingSettings) -> LoggingGuard {
    let filter = build_env_filter(settings.filter.as_deref());
    if !settings.file || atty::is(atty::Stream::Stdout) {
        init_stdout_logging(filter);
        return LoggingGuard { _worker_guard: None };
    }

    let dir = settings.directory.clone().unwrap_or_else(log_dir);
    match init_file_logging(dir, filter) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: querygate file logging unavailable ({e}); logging to stdout only");
            init_stdout_logging(build_env_filter(settings.filter.as_deref()));
            LoggingGuard { _worker_guard: None }
        }
    }
}

fn init_stdout_logging(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn init_file_logging(dir: PathBuf, filter: EnvFilter) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(&dir)?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("querygate")
        .filename_suffix("log")
        .build(&dir)?;
    let (file, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.with_max_level(tracing::Level::INFO).and(file))
        .with_env_filter(filter)
        .with_ansi(false)
        .try_init()?;
    Ok(guard)
}

/// Configured filter, then `QUERYGATE_LOG`, then `RUST_LOG`, then the
/// build default. An invalid configured filter falls back to the default.
fn build_env_filter(configured: Option<&str>) -> EnvFilter {
    if let Some(filter) = configured {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Driver crates are noisy below `warn`.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,querygate_core=trace,tokio_postgres=warn,mongodb=warn"
    } else {
        "info,tokio_postgres=warn,mongodb=warn"
    }
}

/// `<data dir>/querygate/logs`.
pub fn log_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("querygate")
        .join("logs")
}
