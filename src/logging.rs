//! Logging initialization with file output support

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "throttle-bridge.log";

/// Initialize the global subscriber.
///
/// `RUST_LOG` directives are honoured; `verbose` lowers the default level
/// from INFO to DEBUG. When `log_dir` is given a daily rotating file layer is
/// added and the returned guard must be kept alive for the program lifetime,
/// otherwise buffered lines are lost on exit.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Option<WorkerGuard> {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::from_default_env().add_directive(default_level.into());

    let console_layer = fmt::layer().with_target(true).with_thread_ids(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return None;
    };

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Some(guard)
}
