//! Per-key cache entries and the options that govern their lifetime.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::error::QueryError;
use super::key::CacheKey;
use super::retry::RetryPolicy;
use crate::config::CacheConfig;

/// Type-erased cached value. Typed access goes through a downcast.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Outcome of one background fetch, shared between every joined caller.
pub(crate) type FetchOutcome = Result<AnyValue, QueryError>;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No data and nothing in flight
  Idle,
  /// A fetch is in flight (data from an earlier fetch may still be present)
  Fetching,
  /// The last write succeeded
  Success,
  /// The last fetch failed after its retries
  Error,
}

/// Per-query tuning. Defaults come from [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
  /// How long after a successful write the value is served without a network call.
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before eviction.
  pub gc_time: Duration,
  /// Retry budget and backoff for the fetcher.
  pub retry: RetryPolicy,
  /// A disabled query never fetches on its own.
  pub enabled: bool,
  /// Background refetch period while observed.
  pub refetch_interval: Option<Duration>,
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn with_retries(mut self, max_retries: u32) -> Self {
    self.retry.max_retries = max_retries;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
    self.refetch_interval = Some(interval);
    self
  }
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for QueryOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      stale_time: config.stale_time(),
      gc_time: config.gc_time(),
      retry: RetryPolicy::for_queries(config),
      enabled: true,
      refetch_interval: None,
    }
  }
}

/// The fetch currently owning an entry's `Fetching` status.
pub(crate) struct InFlight {
  pub seq: u64,
  pub handle: SharedFetch,
}

/// One cached key. Owned by the store; never handed out mutably.
pub(crate) struct Entry {
  /// Distinguishes this entry from earlier ones removed under the same key.
  pub id: u64,
  pub key: CacheKey,
  pub value: Option<AnyValue>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub fetched_at: Option<Instant>,
  pub fetched_wall: Option<DateTime<Utc>>,
  pub stale_at: Instant,
  pub gc_at: Instant,
  pub in_flight: Option<InFlight>,
  pub subscriber_count: usize,
  /// Sequence number of the last write that landed on this entry.
  pub applied_seq: u64,
  pub stale_time: Duration,
  pub gc_time: Duration,
  pub changes: watch::Sender<u64>,
}

impl Entry {
  pub fn new(key: CacheKey, options: &QueryOptions, now: Instant) -> Self {
    let (changes, _) = watch::channel(0);
    Self {
      id: 0,
      key,
      value: None,
      status: QueryStatus::Idle,
      error: None,
      fetched_at: None,
      fetched_wall: None,
      stale_at: now,
      gc_at: now + options.gc_time,
      in_flight: None,
      subscriber_count: 0,
      applied_seq: 0,
      stale_time: options.stale_time,
      gc_time: options.gc_time,
      changes,
    }
  }

  pub fn apply_options(&mut self, options: &QueryOptions) {
    self.stale_time = options.stale_time;
    self.gc_time = options.gc_time;
  }

  pub fn is_fresh(&self, now: Instant) -> bool {
    self.value.is_some() && now < self.stale_at
  }

  /// Replace value and status together and restart both deadlines.
  pub fn write(&mut self, value: Option<AnyValue>, status: QueryStatus, seq: u64, now: Instant) {
    self.value = value;
    self.status = status;
    if status != QueryStatus::Error {
      self.error = None;
    }
    self.fetched_at = Some(now);
    self.fetched_wall = Some(Utc::now());
    self.stale_at = now + self.stale_time;
    self.gc_at = now + self.gc_time;
    self.applied_seq = seq;
    self.settle_status();
    self.notify();
  }

  /// Keep `in_flight.is_some() => status == Fetching` after any change.
  pub fn settle_status(&mut self) {
    if self.in_flight.is_some() {
      self.status = QueryStatus::Fetching;
    } else if self.status == QueryStatus::Fetching {
      self.status = if self.error.is_some() {
        QueryStatus::Error
      } else if self.value.is_some() {
        QueryStatus::Success
      } else {
        QueryStatus::Idle
      };
    }
  }

  pub fn notify(&self) {
    self.changes.send_modify(|version| *version = version.wrapping_add(1));
  }

  pub fn state(&self) -> EntryState {
    EntryState {
      key: self.key.clone(),
      value: self.value.clone(),
      status: self.status,
      error: self.error.clone(),
      fetched_at: self.fetched_at,
      fetched_wall: self.fetched_wall,
      stale_at: self.stale_at,
      gc_at: self.gc_at,
      subscriber_count: self.subscriber_count,
      fetching: self.in_flight.is_some(),
    }
  }
}

/// Read-only copy of an entry at one instant.
#[derive(Clone)]
pub struct EntryState {
  pub key: CacheKey,
  pub(crate) value: Option<AnyValue>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub fetched_at: Option<Instant>,
  pub fetched_wall: Option<DateTime<Utc>>,
  pub stale_at: Instant,
  pub gc_at: Instant,
  pub subscriber_count: usize,
  pub fetching: bool,
}

impl EntryState {
  pub fn has_value(&self) -> bool {
    self.value.is_some()
  }

  /// The cached value, if present and of type `V`.
  pub fn data<V: Clone + 'static>(&self) -> Option<V> {
    self.try_data().ok().flatten()
  }

  /// Like [`EntryState::data`] but reports a type mismatch instead of hiding it.
  pub fn try_data<V: Clone + 'static>(&self) -> Result<Option<V>, QueryError> {
    match &self.value {
      None => Ok(None),
      Some(value) => downcast(&self.key, value).map(Some),
    }
  }

  pub fn is_stale_at(&self, now: Instant) -> bool {
    now >= self.stale_at
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now())
  }
}

impl std::fmt::Debug for EntryState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EntryState")
      .field("key", &self.key)
      .field("has_value", &self.value.is_some())
      .field("status", &self.status)
      .field("error", &self.error)
      .field("subscriber_count", &self.subscriber_count)
      .field("fetching", &self.fetching)
      .finish_non_exhaustive()
  }
}

pub(crate) fn downcast<V: Clone + 'static>(key: &CacheKey, value: &AnyValue) -> Result<V, QueryError> {
  value
    .downcast_ref::<V>()
    .cloned()
    .ok_or_else(|| QueryError::TypeMismatch {
      key: key.serialize(),
    })
}
