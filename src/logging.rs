//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "querysync.log";

/// `RUST_LOG` if set, otherwise the configured level.
fn env_filter(level: &str) -> Result<EnvFilter> {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", level, e))
}

/// Install the global subscriber.
///
/// Logs go to stderr, or to a daily-rotated file when a directory is configured. In the
/// latter case the returned guard flushes the writer on drop and must be held until exit.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = env_filter(&config.level)?;

  let (layer, guard) = match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => {
      let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed();
      (layer, None)
    }
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_configured_level_parses() {
    assert!(env_filter("querysync=debug,info").is_ok());
  }
}
