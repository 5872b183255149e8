//! Fetch Coordinator: at most one network operation per key, with retries.
//!
//! Every fetch runs in its own task, so it completes (and is cached) even when all of
//! its callers have gone away. Callers that arrive while it is in flight join the same
//! shared future instead of issuing another request.

use color_eyre::Result;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{downcast, AnyValue, FetchOutcome, InFlight, QueryOptions, QueryStatus, SharedFetch};
use super::error::QueryError;
use super::key::CacheKey;
use super::store::EntryStore;

/// What a fetch request decided while holding the store lock.
enum Plan {
  Cached(AnyValue),
  Await(SharedFetch),
}

/// Issues and deduplicates fetches against one [`EntryStore`].
#[derive(Clone)]
pub struct FetchCoordinator {
  store: Arc<EntryStore>,
}

impl FetchCoordinator {
  pub fn new(store: Arc<EntryStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<EntryStore> {
    &self.store
  }

  /// Return the cached value if fresh, otherwise join or start a fetch.
  ///
  /// 1. A fetch already in flight for `key` is joined (no second request)
  /// 2. A fresh cached value is returned without touching the network
  /// 3. Otherwise `fetcher` runs under the retry policy in `options`
  pub async fn ensure_fresh<V, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &QueryOptions,
  ) -> Result<V, QueryError>
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    self.run(key, fetcher, options, false).await
  }

  /// Start a new fetch even if the cached value is fresh or a fetch is in flight.
  ///
  /// A fetch it replaces keeps running for its own callers, but whichever of the two
  /// completes last cannot overwrite a newer value.
  pub async fn refetch<V, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &QueryOptions,
  ) -> Result<V, QueryError>
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    self.run(key, fetcher, options, true).await
  }

  /// Like [`FetchCoordinator::ensure_fresh`] (or `refetch` when `force` is set), but
  /// without waiting. The outcome only lands in the store.
  pub fn fetch_in_background<V, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &QueryOptions,
    force: bool,
  ) where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let _ = self.plan(key, fetcher, options, force);
  }

  async fn run<V, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &QueryOptions,
    force: bool,
  ) -> Result<V, QueryError>
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let value = match self.plan(key, fetcher, options, force) {
      Plan::Cached(value) => value,
      Plan::Await(handle) => handle.await?,
    };
    downcast(key, &value)
  }

  /// Decide, under one lock, whether to join, serve from cache or start a fetch.
  fn plan<V, F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
    options: &QueryOptions,
    force: bool,
  ) -> Plan
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let now = Instant::now();
    let mut inner = self.store.lock("ensure_fresh");
    let generation = inner.generation();
    let seq = inner.next_seq();
    let entry = inner.entry_mut(key, options, now);
    entry.apply_options(options);

    let joined = match &entry.in_flight {
      Some(flight) if !force => Some((flight.seq, flight.handle.clone())),
      _ => None,
    };
    let cached = match &entry.value {
      Some(value) if !force && now < entry.stale_at => Some(Arc::clone(value)),
      _ => None,
    };

    if let Some((flight_seq, handle)) = joined {
      debug!(key = %key, seq = flight_seq, "Joining in-flight fetch");
      Plan::Await(handle)
    } else if let Some(value) = cached {
      debug!(key = %key, "Serving fresh cached value");
      Plan::Cached(value)
    } else {
      let handle = self.spawn_fetch(key.clone(), seq, generation, fetcher, options);
      entry.in_flight = Some(InFlight {
        seq,
        handle: handle.clone(),
      });
      entry.status = QueryStatus::Fetching;
      entry.notify();
      debug!(key = %key, seq, force, "Started fetch");
      Plan::Await(handle)
    }
  }

  fn spawn_fetch<V, F, Fut>(
    &self,
    key: CacheKey,
    seq: u64,
    generation: u64,
    fetcher: F,
    options: &QueryOptions,
  ) -> SharedFetch
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let store = Arc::clone(&self.store);
    let retry = options.retry;

    let task = tokio::spawn(async move {
      let label = key.serialize();
      let attempt = AssertUnwindSafe(retry.run(&label, &fetcher)).catch_unwind();
      let outcome: FetchOutcome = match attempt.await {
        Ok(Ok(value)) => Ok(Arc::new(value) as AnyValue),
        Ok(Err(exhausted)) => Err(QueryError::fetch(exhausted.attempts, exhausted.error)),
        Err(_) => Err(QueryError::Aborted),
      };
      complete(&store, &key, seq, generation, &outcome);
      outcome
    });

    async move {
      match task.await {
        Ok(outcome) => outcome,
        Err(_) => Err(QueryError::Aborted),
      }
    }
    .boxed()
    .shared()
  }
}

/// Apply a finished fetch to its entry.
///
/// Results land in completion order, but only if their sequence number is newer than
/// the entry's last applied write; anything older is dropped silently.
fn complete(store: &EntryStore, key: &CacheKey, seq: u64, generation: u64, outcome: &FetchOutcome) {
  let now = Instant::now();
  let mut inner = store.lock("complete_fetch");
  if inner.generation() != generation {
    debug!(key = %key, seq, "Dropping fetch result from a cleared session");
    return;
  }
  let Some(entry) = inner.get_mut(key) else {
    debug!(key = %key, seq, "Dropping fetch result for a removed entry");
    return;
  };

  if entry.in_flight.as_ref().is_some_and(|flight| flight.seq == seq) {
    entry.in_flight = None;
  }

  if seq <= entry.applied_seq {
    debug!(key = %key, seq, applied = entry.applied_seq, "Discarding out-of-order fetch result");
    entry.settle_status();
    entry.notify();
    return;
  }

  match outcome {
    Ok(value) => entry.write(Some(Arc::clone(value)), QueryStatus::Success, seq, now),
    Err(error) => {
      warn!(key = %key, seq, error = %error, "Fetch failed");
      entry.error = Some(error.clone());
      entry.status = QueryStatus::Error;
      entry.settle_status();
      entry.notify();
    }
  }
}
