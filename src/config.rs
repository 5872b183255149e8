use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_STALE_TIME_MS: u64 = 10 * 60 * 1000;
const DEFAULT_GC_TIME_MS: u64 = 30 * 60 * 1000;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

/// Session-wide cache defaults. Individual queries may override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long fetched data is served without a network call.
  pub stale_time_ms: u64,
  /// How long unobserved data is kept before eviction.
  pub gc_time_ms: u64,
  /// Retries after the first failed fetch.
  pub query_retries: u32,
  /// Retries after the first failed mutation.
  pub mutation_retries: u32,
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,
  /// Period of the eviction sweep.
  pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: DEFAULT_STALE_TIME_MS,
      gc_time_ms: DEFAULT_GC_TIME_MS,
      query_retries: 1,
      mutation_retries: 1,
      retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
      retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
      sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_millis(self.stale_time_ms)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::from_millis(self.gc_time_ms)
  }

  pub fn retry_base_delay(&self) -> Duration {
    Duration::from_millis(self.retry_base_delay_ms)
  }

  pub fn retry_max_delay(&self) -> Duration {
    Duration::from_millis(self.retry_max_delay_ms)
  }

  /// Sweep interval, never zero (a zero period would spin the scheduler).
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querysync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querysync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("querysync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querysync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to null, not to an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }
}
