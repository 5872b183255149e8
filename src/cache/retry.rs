//! Retry policy with capped exponential backoff.

use color_eyre::{Report, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::CacheConfig;

/// How many times to retry a failing operation, and how long to wait in between.
///
/// The delay before retry `n` (zero based) is `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

/// The operation failed on every attempt.
#[derive(Debug)]
pub struct Exhausted {
  /// Total number of attempts made, including the first.
  pub attempts: u32,
  /// Error from the last attempt.
  pub error: Report,
}

impl RetryPolicy {
  /// Never retry.
  pub const NONE: RetryPolicy = RetryPolicy {
    max_retries: 0,
    base_delay: Duration::ZERO,
    max_delay: Duration::ZERO,
  };

  pub fn for_queries(config: &CacheConfig) -> Self {
    Self {
      max_retries: config.query_retries,
      base_delay: config.retry_base_delay(),
      max_delay: config.retry_max_delay(),
    }
  }

  pub fn for_mutations(config: &CacheConfig) -> Self {
    Self {
      max_retries: config.mutation_retries,
      ..Self::for_queries(config)
    }
  }

  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds or the retry budget is spent.
  pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> std::result::Result<T, Exhausted>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut retry = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(error) if retry < self.max_retries => {
          let delay = self.delay_for(retry);
          warn!(
            op = label,
            attempt = retry + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
          );
          tokio::time::sleep(delay).await;
          retry += 1;
        }
        Err(error) => {
          return Err(Exhausted {
            attempts: retry + 1,
            error,
          })
        }
      }
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::for_queries(&CacheConfig::default())
  }
}
