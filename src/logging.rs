// src/logging.rs
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Install the tracing subscriber: formatted stdout plus a non-blocking
/// daily file appender under `./log`. The configured queue capacity bounds
/// the writer's buffered lines; the writer is lossy, appends are
/// best-effort under backpressure.
///
/// Returns the appender guard; hold it until exit so buffered lines flush.
/// Returns `None` (and installs nothing) when logging is disabled.
pub fn init(cfg: &Config) -> Option<WorkerGuard> {
    if !cfg.log_enabled {
        return None;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    let _ = std::fs::create_dir_all("./log");
    let file_appender = tracing_appender::rolling::daily("./log", "minuet.log");
    let (file_writer, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(cfg.log_queue_capacity)
        .lossy(true)
        .finish(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Some(guard)
}
