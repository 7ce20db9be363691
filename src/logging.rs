//! Tracing subscriber setup for the `arm` binary

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "ARM_LOG";

/// Filter used when `ARM_LOG` is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// Human-readable output goes to stderr. When `log_file` is given, JSON lines
/// are additionally appended to it through a non-blocking writer; the returned
/// guard must be kept alive for the lifetime of the process so buffered lines
/// are flushed.
pub fn init(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_file.and_then(|path| Some((path.parent()?, path.file_name()?))) {
        Some((dir, file_name)) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
