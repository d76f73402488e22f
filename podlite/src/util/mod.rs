use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Daemon log file name inside the log directory; rotated daily.
const DAEMON_LOG: &str = "podlited.log";

/// Sets up daemon logging.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// `debug` is true. With a `log_dir` the output goes to a daily rolling file,
/// otherwise to stderr. The returned guard must stay alive for buffered
/// lines to be flushed.
pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> PodliteResult<WorkerGuard> {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| PodliteError::Config(format!("invalid log filter: {}", e)))?;

    let (non_blocking, guard, ansi) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                PodliteError::Config(format!(
                    "failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, DAEMON_LOG);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, false)
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, true)
        }
    };

    register_to_tracing(non_blocking, env_filter, ansi);
    Ok(guard)
}

/// Installs the global subscriber; a second call leaves the first in place.
pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, ansi: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}
