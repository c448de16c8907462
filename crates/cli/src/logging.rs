//! Logging setup for the daemon process.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize logging with a console layer and a daily-rolling file in the
/// data directory. Returns the guard that must be kept alive for the
/// duration of the process.
pub fn init_logging(data_dir: &Path) -> Option<WorkerGuard> {
  let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

  if std::fs::create_dir_all(data_dir).is_err() {
    // Fall back to console-only logging.
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(data_dir, "cnavd.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let console_layer = tracing_subscriber::fmt::layer().with_target(true).with_ansi(true);
  let file_layer = tracing_subscriber::fmt::layer()
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(console_layer)
    .with(file_layer)
    .init();

  Some(guard)
}
