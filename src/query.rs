//! Observed queries over the shared cache.
//!
//! Inspired by TanStack Query's `useQuery`, a [`QueryObserver`] subscribes to one key for
//! as long as it lives. It starts a fetch on creation (unless disabled), exposes the
//! entry's data, status and error, and refreshes in the background when the data goes
//! stale or its refetch interval elapses.
//!
//! # Example
//!
//! ```ignore
//! let api = portal.clone();
//! let mut query = client.query(ScholarshipKey::Lists.cache_key(), move || {
//!   let api = api.clone();
//!   async move { api.list_scholarships().await }
//! }, client.default_options());
//!
//! // In event loop tick
//! if query.poll() {
//!   // Entry changed, trigger re-render
//! }
//!
//! // In render
//! let result = query.state();
//! if result.is_loading() {
//!   render_spinner();
//! } else if let Some(items) = result.data {
//!   render_items(&items);
//! }
//! ```

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{CacheKey, FetchCoordinator, QueryError, QueryOptions, QueryStatus, Subscription};

/// A factory function that creates futures for fetching data
type FetcherFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// What an observer currently sees for its key.
#[derive(Debug, Clone)]
pub struct QueryResult<V> {
  pub data: Option<V>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub is_stale: bool,
  pub is_fetching: bool,
  pub updated_at: Option<DateTime<Utc>>,
}

impl<V> QueryResult<V> {
  fn empty() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      is_stale: true,
      is_fetching: false,
      updated_at: None,
    }
  }

  /// First load: fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.is_fetching && self.data.is_none()
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

/// Subscription to one key plus the fetcher that fills it.
///
/// Dropping the observer unsubscribes. A fetch it started keeps running and its result
/// is still cached.
pub struct QueryObserver<V> {
  fetch: FetchCoordinator,
  key: CacheKey,
  fetcher: FetcherFn<V>,
  options: QueryOptions,
  subscription: Subscription,
}

impl<V: Clone + Send + Sync + 'static> QueryObserver<V> {
  pub fn new<F, Fut>(fetch: FetchCoordinator, key: CacheKey, fetcher: F, options: QueryOptions) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let subscription = fetch.store().subscribe(&key, &options);
    let observer = Self {
      fetch,
      key,
      fetcher: Arc::new(move || fetcher().boxed()),
      options,
      subscription,
    };
    observer.fetch();
    observer
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn options(&self) -> &QueryOptions {
    &self.options
  }

  /// Get the current view of the entry.
  pub fn state(&self) -> QueryResult<V> {
    let Some(entry) = self.fetch.store().read(&self.key) else {
      return QueryResult::empty();
    };
    let (data, error) = match entry.try_data::<V>() {
      Ok(data) => (data, entry.error.clone()),
      Err(mismatch) => (None, Some(mismatch)),
    };
    QueryResult {
      data,
      status: entry.status,
      error,
      is_stale: entry.is_stale(),
      is_fetching: entry.fetching,
      updated_at: entry.fetched_wall,
    }
  }

  /// Get the data if any has been cached.
  pub fn data(&self) -> Option<V> {
    self.state().data
  }

  pub fn is_loading(&self) -> bool {
    self.state().is_loading()
  }

  pub fn is_fetching(&self) -> bool {
    self.state().is_fetching
  }

  pub fn is_success(&self) -> bool {
    self.state().is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state().is_error()
  }

  pub fn error(&self) -> Option<QueryError> {
    self.state().error
  }

  /// Fetch unless the data is fresh or a fetch is already running.
  ///
  /// This is a no-op for a disabled query.
  pub fn fetch(&self) {
    if !self.options.enabled {
      return;
    }
    self.start(false);
  }

  /// Force a new fetch, even for a disabled query or while one is in flight.
  pub fn refetch(&self) {
    self.start(true);
  }

  /// Wait for the current data without subscribing to later changes.
  pub async fn load(&self) -> Result<V, QueryError> {
    let fetcher = Arc::clone(&self.fetcher);
    self
      .fetch
      .ensure_fresh(&self.key, move || fetcher(), &self.options)
      .await
  }

  /// Check for changes to the entry and refresh it if due.
  ///
  /// Returns `true` if the entry changed since the last poll or a refresh was started.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = match self.subscription.changes().has_changed() {
      Ok(changed) => changed,
      // The entry was removed (logout, eviction is impossible while subscribed).
      Err(_) => true,
    };
    if changed {
      self.subscription.changes().borrow_and_update();
    }

    let now = Instant::now();
    match self.fetch.store().read(&self.key) {
      None => {
        debug!(key = %self.key, "Observed entry is gone, subscribing again");
        self.subscription = self.fetch.store().subscribe(&self.key, &self.options);
        self.fetch();
        changed = true;
      }
      Some(entry) if self.options.enabled && !entry.fetching => {
        let interval_due = match (self.options.refetch_interval, entry.fetched_at) {
          (Some(interval), Some(fetched_at)) => now >= fetched_at + interval,
          _ => false,
        };
        // A failed entry waits for an explicit refetch instead of retrying every tick.
        let stale = entry.is_stale_at(now) && entry.status != QueryStatus::Error;
        if interval_due || stale {
          debug!(key = %self.key, interval_due, "Refreshing observed entry");
          self.start(interval_due);
          self.subscription.changes().borrow_and_update();
          changed = true;
        }
      }
      Some(_) => {}
    }
    changed
  }

  /// Wait until the entry changes. Returns `false` if the entry was removed.
  pub async fn changed(&mut self) -> bool {
    self.subscription.changes().changed().await.is_ok()
  }

  /// Wait until no fetch is running for the key, then return what is cached.
  pub async fn settled(&mut self) -> QueryResult<V> {
    loop {
      self.subscription.changes().borrow_and_update();
      let state = self.state();
      if !state.is_fetching {
        return state;
      }
      if !self.changed().await {
        return self.state();
      }
    }
  }

  fn start(&self, force: bool) {
    let fetcher = Arc::clone(&self.fetcher);
    self
      .fetch
      .fetch_in_background(&self.key, move || fetcher(), &self.options, force);
  }
}

impl<V> std::fmt::Debug for QueryObserver<V> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryStore;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn coordinator() -> FetchCoordinator {
    FetchCoordinator::new(Arc::new(EntryStore::default()))
  }

  fn options() -> QueryOptions {
    QueryOptions::default()
      .with_stale_time(Duration::from_secs(60))
      .with_retries(0)
  }

  fn counting(calls: &Arc<AtomicU32>) -> impl Fn() -> BoxFuture<'static, Result<u32>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(n)
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_success() {
    let mut query = QueryObserver::new(
      coordinator(),
      CacheKey::from(["items"]),
      || async { Ok(vec![1, 2, 3]) },
      options(),
    );
    assert!(query.is_loading());

    let result = query.settled().await;
    assert!(result.is_success());
    assert_eq!(result.data, Some(vec![1, 2, 3]));
    assert!(!result.is_stale);
    assert!(result.updated_at.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_query_error() {
    let mut query: QueryObserver<i32> = QueryObserver::new(
      coordinator(),
      CacheKey::from(["items"]),
      || async { Err(eyre!("Something went wrong")) },
      options(),
    );

    let result = query.settled().await;
    assert!(result.is_error());
    assert_eq!(
      result.error.map(|e| e.to_string()),
      Some("Something went wrong".to_string())
    );
    // Errors are not retried on every tick.
    query.poll();
    assert!(!query.is_fetching());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_data_refreshes_on_poll() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = QueryObserver::new(
      coordinator(),
      CacheKey::from(["items"]),
      counting(&calls),
      options().with_stale_time(Duration::ZERO),
    );
    assert_eq!(query.settled().await.data, Some(1));

    assert!(query.poll());
    assert!(query.is_fetching());
    assert_eq!(query.settled().await.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_while_loading_is_noop() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = QueryObserver::new(coordinator(), CacheKey::from(["items"]), counting(&calls), options());
    assert!(query.is_loading());

    // Second fetch joins the first
    query.fetch();
    query.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Fresh data is served from the cache
    query.fetch();
    assert!(!query.is_fetching());
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_supersedes_pending() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = QueryObserver::new(coordinator(), CacheKey::from(["items"]), counting(&calls), options());

    query.refetch();
    let result = query.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // Both completed; the later write wins.
    assert_eq!(result.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_query_never_fetches_on_its_own() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = QueryObserver::new(
      coordinator(),
      CacheKey::from(["auth", "currentUser"]),
      counting(&calls),
      options().enabled(false),
    );
    assert_eq!(query.state().status, QueryStatus::Idle);
    query.poll();
    query.fetch();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    query.refetch();
    assert_eq!(query.settled().await.data, Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_interval() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = QueryObserver::new(
      coordinator(),
      CacheKey::from(["scholarships"]),
      counting(&calls),
      options().with_refetch_interval(Duration::from_secs(5)),
    );
    query.settled().await;

    tokio::time::advance(Duration::from_secs(2)).await;
    query.poll();
    assert!(!query.is_fetching());

    tokio::time::advance(Duration::from_secs(4)).await;
    query.poll();
    assert!(query.is_fetching());
    assert_eq!(query.settled().await.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_observers_share_entry_and_unsubscribe_on_drop() {
    let fetch = coordinator();
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::from(["items"]);
    let mut a = QueryObserver::new(fetch.clone(), key.clone(), counting(&calls), options());
    let b = QueryObserver::new(fetch.clone(), key.clone(), counting(&calls), options());
    assert_eq!(fetch.store().read(&key).unwrap().subscriber_count, 2);

    a.settled().await;
    assert_eq!(b.data(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(b);
    assert_eq!(fetch.store().read(&key).unwrap().subscriber_count, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_after_clear_subscribes_again() {
    let fetch = coordinator();
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::from(["items"]);
    let mut query = QueryObserver::new(fetch.clone(), key.clone(), counting(&calls), options());
    query.settled().await;

    fetch.store().clear();
    assert!(query.poll());
    assert_eq!(fetch.store().read(&key).unwrap().subscriber_count, 1);
    assert_eq!(query.settled().await.data, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_after_remove_keeps_entry_observed() {
    let fetch = coordinator();
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::from(["auth", "currentUser"]);
    let options = options().with_gc_time(Duration::from_secs(10));
    let mut query = QueryObserver::new(fetch.clone(), key.clone(), counting(&calls), options);
    query.settled().await;

    assert_eq!(fetch.store().remove_matching(&CacheKey::from(["auth"])), 1);
    assert!(query.poll());
    assert_eq!(query.settled().await.data, Some(2));
    assert_eq!(fetch.store().read(&key).unwrap().subscriber_count, 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(fetch.store().evict_expired(Instant::now()).is_empty());

    drop(query);
    assert_eq!(fetch.store().read(&key).unwrap().subscriber_count, 0);
  }
}
