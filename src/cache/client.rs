//! `QueryClient`: the per-session handle to the cache.
//!
//! A client owns one [`EntryStore`] and, once started, its [`EvictionScheduler`]. It is
//! created at session start and passed to whatever needs cached data; [`QueryClient::clear`]
//! ends the session's data (logout). Clones share the same store.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::entry::{QueryOptions, QueryStatus};
use super::error::QueryError;
use super::fetch::FetchCoordinator;
use super::gc::EvictionScheduler;
use super::key::CacheKey;
use super::mutation::{MutationBuilder, NotificationSink, TracingSink};
use super::retry::RetryPolicy;
use super::store::EntryStore;
use crate::config::CacheConfig;
use crate::query::QueryObserver;

#[derive(Clone)]
pub struct QueryClient {
  fetch: FetchCoordinator,
  config: Arc<CacheConfig>,
  sink: Arc<dyn NotificationSink>,
  scheduler: Option<Arc<EvictionScheduler>>,
}

impl QueryClient {
  /// Create a client without background eviction.
  pub fn new(config: CacheConfig) -> Self {
    let store = Arc::new(EntryStore::new(QueryOptions::from(&config)));
    Self {
      fetch: FetchCoordinator::new(store),
      config: Arc::new(config),
      sink: Arc::new(TracingSink),
      scheduler: None,
    }
  }

  /// Create a client and start its eviction sweep. Requires a Tokio runtime.
  pub fn start(config: CacheConfig) -> Self {
    let mut client = Self::new(config);
    let scheduler = EvictionScheduler::spawn(Arc::clone(client.store()), client.config.sweep_interval());
    client.scheduler = Some(Arc::new(scheduler));
    info!(
      stale_time_ms = client.config.stale_time_ms,
      gc_time_ms = client.config.gc_time_ms,
      sweep_interval_ms = client.config.sweep_interval_ms,
      "Query cache session started"
    );
    client
  }

  /// Route mutation outcomes to `sink` instead of the log.
  pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
    self.sink = sink;
    self
  }

  pub fn store(&self) -> &Arc<EntryStore> {
    self.fetch.store()
  }

  pub fn coordinator(&self) -> &FetchCoordinator {
    &self.fetch
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Options for a query that does not override anything.
  pub fn default_options(&self) -> QueryOptions {
    QueryOptions::from(&*self.config)
  }

  /// Observe `key` (the `useQuery` entry point). Fetches on creation if enabled.
  pub fn query<V, F, Fut>(&self, key: CacheKey, fetcher: F, options: QueryOptions) -> QueryObserver<V>
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    QueryObserver::new(self.fetch.clone(), key, fetcher, options)
  }

  /// Start describing a mutation (the `useMutation` entry point).
  pub fn mutation<I, R, F, Fut>(&self, name: impl Into<String>, mutation_fn: F) -> MutationBuilder<I, R>
  where
    I: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    MutationBuilder::new(
      Arc::clone(self.store()),
      name,
      mutation_fn,
      RetryPolicy::for_mutations(&self.config),
      Arc::clone(&self.sink),
    )
  }

  /// Cached value if fresh, otherwise the result of a (possibly shared) fetch.
  pub async fn fetch_query<V, F, Fut>(
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
    self.fetch.ensure_fresh(key, fetcher, options).await
  }

  /// Warm the cache for `key`. Failures are logged, not returned.
  pub async fn prefetch<V, F, Fut>(&self, key: &CacheKey, fetcher: F, options: &QueryOptions)
  where
    V: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    if let Err(error) = self.fetch.ensure_fresh(key, fetcher, options).await {
      debug!(key = %key, error = %error, "Prefetch failed");
    }
  }

  pub fn get_query_data<V: Clone + 'static>(&self, key: &CacheKey) -> Option<V> {
    self.store().read(key)?.data()
  }

  /// Write a value as if it had just been fetched.
  pub fn set_query_data<V: Send + Sync + 'static>(&self, key: &CacheKey, value: V) {
    self.store().write(key, value, QueryStatus::Success);
  }

  /// Mark everything under `prefix` stale. Returns the number of entries affected.
  pub fn invalidate(&self, prefix: &CacheKey) -> usize {
    self.store().invalidate(prefix)
  }

  /// Hard delete everything under `prefix`.
  pub fn remove_queries(&self, prefix: &CacheKey) -> usize {
    self.store().remove_matching(prefix)
  }

  /// End of session: drop every entry. Work still in flight is discarded on arrival.
  pub fn clear(&self) -> usize {
    self.store().clear()
  }

  /// Run one eviction sweep now. Returns the number of entries evicted.
  pub fn sweep(&self) -> usize {
    match &self.scheduler {
      Some(scheduler) => scheduler.sweep_now().unwrap_or(0),
      None => self.store().evict_expired(tokio::time::Instant::now()).len(),
    }
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new(CacheConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_set_and_get_query_data() {
    let client = QueryClient::default();
    let key = CacheKey::from(["auth", "currentUser"]);
    assert_eq!(client.get_query_data::<String>(&key), None);

    client.set_query_data(&key, "ada".to_string());
    assert_eq!(client.get_query_data::<String>(&key), Some("ada".to_string()));
    assert_eq!(client.get_query_data::<u32>(&key), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_then_fresh_read_skips_network() {
    let client = QueryClient::default();
    let key = CacheKey::from(["scholarships", "list"]);
    let options = client.default_options();

    client.prefetch(&key, || async { Ok(vec![1, 2, 3]) }, &options).await;
    let value: Vec<i32> = client
      .fetch_query(&key, || async { Err(color_eyre::eyre::eyre!("should not be called")) }, &options)
      .await
      .unwrap();
    assert_eq!(value, vec![1, 2, 3]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_swallows_errors() {
    let client = QueryClient::default();
    let key = CacheKey::from(["archived"]);
    let options = client.default_options().with_retries(0);
    client
      .prefetch(&key, || async { Err::<u8, _>(color_eyre::eyre::eyre!("down")) }, &options)
      .await;
    assert_eq!(client.store().read(&key).unwrap().status, QueryStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_started_client_sweeps_and_clears() {
    let config = CacheConfig {
      gc_time_ms: 1000,
      sweep_interval_ms: 500,
      ..CacheConfig::default()
    };
    let client = QueryClient::start(config);
    let key = CacheKey::from(["scholarships", "statistics"]);
    client.set_query_data(&key, 3u32);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(client.get_query_data::<u32>(&key).is_none());

    client.set_query_data(&key, 4u32);
    client.set_query_data(&CacheKey::from(["auth", "currentUser"]), 1u8);
    assert_eq!(client.remove_queries(&CacheKey::from(["auth"])), 1);
    assert_eq!(client.clear(), 1);
    assert!(client.store().is_empty());
  }
}
