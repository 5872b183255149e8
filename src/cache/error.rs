//! Error types surfaced by the cache.

use color_eyre::Report;
use std::fmt;
use std::sync::Arc;

/// An `eyre::Report` that can be handed to every caller joined on the same fetch.
///
/// Display and Debug are the wrapped report's, unmodified.
#[derive(Clone)]
pub struct SharedReport(Arc<Report>);

impl SharedReport {
  pub fn new(report: Report) -> Self {
    Self(Arc::new(report))
  }

  /// The report exactly as the fetcher returned it.
  pub fn report(&self) -> &Report {
    &self.0
  }
}

impl fmt::Display for SharedReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&*self.0, f)
  }
}

impl fmt::Debug for SharedReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}

impl std::error::Error for SharedReport {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self.0.source()
  }
}

/// Errors produced by the query side of the cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
  /// The fetcher kept failing until the retry budget ran out.
  #[error("{source}")]
  Fetch { attempts: u32, source: SharedReport },

  /// The background fetch task panicked or was torn down by the runtime.
  #[error("fetch task was aborted before it completed")]
  Aborted,

  /// The key holds a value of a different type than the one requested.
  #[error("cached value for {key} has a different type than requested")]
  TypeMismatch { key: String },
}

impl QueryError {
  pub(crate) fn fetch(attempts: u32, report: Report) -> Self {
    Self::Fetch {
      attempts,
      source: SharedReport::new(report),
    }
  }

  /// The fetcher's original error, if this is a fetch failure.
  pub fn report(&self) -> Option<&Report> {
    match self {
      Self::Fetch { source, .. } => Some(source.report()),
      _ => None,
    }
  }
}
