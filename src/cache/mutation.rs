//! Optimistic Mutation Engine.
//!
//! A mutation runs in four steps:
//!
//! 1. Detach in-flight fetches under the affected keys and snapshot their entries
//! 2. Apply the optimistic updater so readers see the change immediately
//! 3. Run the mutation function (with its retry policy)
//! 4. Settle: on failure restore the snapshot, then, on both paths, invalidate every
//!    affected key so the next read reconciles with the server
//!
//! Step 4 also runs if the `mutate` future is dropped before the server answers, in
//! which case it is treated as a failure.

use color_eyre::{Report, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::{downcast, AnyValue, QueryOptions, QueryStatus};
use super::error::QueryError;
use super::key::CacheKey;
use super::lock::mutex_lock;
use super::retry::RetryPolicy;
use super::store::{EntryStore, StoreInner};

const SOURCE: &str = "cache::mutation";

/// Status of the most recent invocation of a mutation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Pending,
  Success,
  Error,
}

/// Edge hook for user-facing notifications (toasts, status lines, logs).
pub trait NotificationSink: Send + Sync {
  fn mutation_succeeded(&self, _name: &str) {}

  /// Called once per mutation that failed after its retries.
  fn mutation_failed(&self, name: &str, error: &Report);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn mutation_succeeded(&self, name: &str) {
    info!(mutation = name, "Mutation succeeded");
  }

  fn mutation_failed(&self, name: &str, error: &Report) {
    warn!(mutation = name, error = %error, "Mutation failed");
  }
}

struct Snapshot {
  key: CacheKey,
  value: Option<AnyValue>,
  status: QueryStatus,
  error: Option<QueryError>,
}

/// Prior state of every entry a mutation touched, kept only until settlement.
pub struct MutationContext {
  previous: HashMap<String, Snapshot>,
  generation: u64,
}

impl MutationContext {
  fn new(generation: u64) -> Self {
    Self {
      previous: HashMap::new(),
      generation,
    }
  }

  /// Record the current state of `key` unless it was already recorded.
  fn capture(&mut self, inner: &StoreInner, key: &CacheKey) {
    let canonical = key.serialize();
    if self.previous.contains_key(&canonical) {
      return;
    }
    let snapshot = match inner.get(key) {
      Some(entry) => Snapshot {
        key: key.clone(),
        value: entry.value.clone(),
        status: match entry.status {
          QueryStatus::Fetching if entry.value.is_some() => QueryStatus::Success,
          QueryStatus::Fetching => QueryStatus::Idle,
          status => status,
        },
        error: entry.error.clone(),
      },
      None => Snapshot {
        key: key.clone(),
        value: None,
        status: QueryStatus::Idle,
        error: None,
      },
    };
    self.previous.insert(canonical, snapshot);
  }

  /// Keys whose prior state is held for rollback.
  pub fn snapshot_keys(&self) -> Vec<CacheKey> {
    self.previous.values().map(|s| s.key.clone()).collect()
  }
}

/// Write access to the cache inside an optimistic updater.
///
/// Every key written through it is snapshotted first, whether or not it was declared as
/// affected, so rollback covers it.
pub struct OptimisticWrite<'a> {
  inner: &'a mut StoreInner,
  context: &'a mut MutationContext,
  defaults: &'a QueryOptions,
  now: Instant,
}

impl OptimisticWrite<'_> {
  /// Current cached value for `key`, if present and of type `V`.
  pub fn get<V: Clone + 'static>(&self, key: &CacheKey) -> Option<V> {
    let entry = self.inner.get(key)?;
    downcast(key, entry.value.as_ref()?).ok()
  }

  /// Replace the value for `key`.
  pub fn set<V: Send + Sync + 'static>(&mut self, key: &CacheKey, value: V) {
    self.context.capture(self.inner, key);
    self.inner.supersede_fetch(key);
    let value: AnyValue = Arc::new(value);
    self
      .inner
      .write(key, Some(value), QueryStatus::Success, self.defaults, self.now);
  }

  /// Compute the next value for `key` from the current one.
  ///
  /// Returns false (and writes nothing) if the key holds a value of another type.
  pub fn update<V, F>(&mut self, key: &CacheKey, f: F) -> bool
  where
    V: Clone + Send + Sync + 'static,
    F: FnOnce(Option<V>) -> V,
  {
    let current = match self.inner.get(key).and_then(|entry| entry.value.clone()) {
      None => None,
      Some(value) => match downcast::<V>(key, &value) {
        Ok(v) => Some(v),
        Err(_) => {
          warn!(key = %key, "Skipping optimistic update of a differently typed entry");
          return false;
        }
      },
    };
    self.set(key, f(current));
    true
  }

  /// Update every cached entry of type `V` under `prefix`. Returns how many changed.
  pub fn update_matching<V, F>(&mut self, prefix: &CacheKey, mut f: F) -> usize
  where
    V: Clone + Send + Sync + 'static,
    F: FnMut(V) -> V,
  {
    let mut count = 0;
    for key in self.inner.matching(prefix) {
      if let Some(current) = self.get::<V>(&key) {
        self.set(&key, f(current));
        count += 1;
      }
    }
    count
  }
}

/// Snapshot the affected entries and apply the optimistic update, atomically.
fn begin(
  store: &EntryStore,
  affected: &[CacheKey],
  updater: impl FnOnce(&mut OptimisticWrite<'_>),
) -> MutationContext {
  let now = Instant::now();
  let mut inner = store.lock("begin_mutation");
  let mut context = MutationContext::new(inner.generation());

  for prefix in affected {
    for key in inner.matching(prefix) {
      inner.supersede_fetch(&key);
      context.capture(&inner, &key);
    }
  }

  let mut write = OptimisticWrite {
    inner: &mut inner,
    context: &mut context,
    defaults: store.defaults(),
    now,
  };
  updater(&mut write);
  context
}

/// Roll back (on failure), then invalidate affected and touched keys.
fn settle(
  store: &EntryStore,
  affected: &[CacheKey],
  mut context: MutationContext,
  failed: bool,
  reconcile: impl FnOnce(&mut OptimisticWrite<'_>),
) {
  let now = Instant::now();
  let mut inner = store.lock("settle_mutation");
  if inner.generation() != context.generation {
    debug!("Session was cleared during mutation, skipping settlement");
    return;
  }

  let touched = context.snapshot_keys();
  if failed {
    for snapshot in context.previous.values() {
      inner.supersede_fetch(&snapshot.key);
      inner.write(
        &snapshot.key,
        snapshot.value.clone(),
        snapshot.status,
        store.defaults(),
        now,
      );
      if let Some(entry) = inner.get_mut(&snapshot.key) {
        entry.error = snapshot.error.clone();
      }
    }
    warn!(restored = touched.len(), "Rolled back optimistic update");
  } else {
    let mut discarded = MutationContext::new(context.generation);
    let mut write = OptimisticWrite {
      inner: &mut inner,
      context: &mut discarded,
      defaults: store.defaults(),
      now,
    };
    reconcile(&mut write);
  }
  context.previous.clear();

  for key in affected.iter().chain(&touched) {
    inner.invalidate(key, now);
  }
}

/// Settles on drop if the mutation future is abandoned mid-flight.
struct Settlement {
  store: Arc<EntryStore>,
  affected: Arc<[CacheKey]>,
  context: Option<MutationContext>,
}

impl Settlement {
  fn succeed(mut self, reconcile: impl FnOnce(&mut OptimisticWrite<'_>)) {
    if let Some(context) = self.context.take() {
      settle(&self.store, &self.affected, context, false, reconcile);
    }
  }

  fn fail(mut self) {
    if let Some(context) = self.context.take() {
      settle(&self.store, &self.affected, context, true, |_| {});
    }
  }
}

impl Drop for Settlement {
  fn drop(&mut self) {
    if let Some(context) = self.context.take() {
      settle(&self.store, &self.affected, context, true, |_| {});
    }
  }
}

type MutationFn<I, R> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<R>> + Send + Sync>;
type OptimisticFn<I> = Arc<dyn Fn(&I, &mut OptimisticWrite<'_>) + Send + Sync>;
type ReconcileFn<R> = Arc<dyn Fn(&R, &mut OptimisticWrite<'_>) + Send + Sync>;

/// A reusable mutation handle (the `useMutation` result).
pub struct Mutation<I, R> {
  store: Arc<EntryStore>,
  name: Arc<str>,
  mutation_fn: MutationFn<I, R>,
  optimistic: Option<OptimisticFn<I>>,
  on_success: Option<ReconcileFn<R>>,
  affected: Arc<[CacheKey]>,
  retry: RetryPolicy,
  sink: Arc<dyn NotificationSink>,
  status: Arc<Mutex<MutationStatus>>,
}

impl<I, R> Clone for Mutation<I, R> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      name: Arc::clone(&self.name),
      mutation_fn: Arc::clone(&self.mutation_fn),
      optimistic: self.optimistic.clone(),
      on_success: self.on_success.clone(),
      affected: Arc::clone(&self.affected),
      retry: self.retry,
      sink: Arc::clone(&self.sink),
      status: Arc::clone(&self.status),
    }
  }
}

impl<I, R> Mutation<I, R>
where
  I: Clone + Send + 'static,
  R: Send + 'static,
{
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn status(&self) -> MutationStatus {
    *mutex_lock(&self.status, SOURCE, "status")
  }

  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }

  fn set_status(&self, status: MutationStatus) {
    *mutex_lock(&self.status, SOURCE, "set_status") = status;
  }

  /// Run the mutation. The error, if any, is the mutation function's own report.
  ///
  /// Whatever the outcome, every affected key ends up invalidated.
  pub async fn mutate(&self, input: I) -> Result<R> {
    self.set_status(MutationStatus::Pending);

    let context = begin(&self.store, &self.affected, |write| {
      if let Some(optimistic) = &self.optimistic {
        optimistic(&input, write);
      }
    });
    debug!(
      mutation = %self.name,
      snapshot = context.previous.len(),
      "Applied optimistic update"
    );
    let settlement = Settlement {
      store: Arc::clone(&self.store),
      affected: Arc::clone(&self.affected),
      context: Some(context),
    };

    let result = self
      .retry
      .run(&self.name, || (self.mutation_fn)(input.clone()))
      .await;

    match result {
      Ok(value) => {
        settlement.succeed(|write| {
          if let Some(on_success) = &self.on_success {
            on_success(&value, write);
          }
        });
        self.set_status(MutationStatus::Success);
        self.sink.mutation_succeeded(&self.name);
        Ok(value)
      }
      Err(exhausted) => {
        settlement.fail();
        self.set_status(MutationStatus::Error);
        self.sink.mutation_failed(&self.name, &exhausted.error);
        Err(exhausted.error)
      }
    }
  }
}

/// Builder for [`Mutation`].
pub struct MutationBuilder<I, R> {
  store: Arc<EntryStore>,
  name: String,
  mutation_fn: MutationFn<I, R>,
  optimistic: Option<OptimisticFn<I>>,
  on_success: Option<ReconcileFn<R>>,
  affected: Vec<CacheKey>,
  retry: RetryPolicy,
  sink: Arc<dyn NotificationSink>,
}

impl<I, R> MutationBuilder<I, R>
where
  I: Clone + Send + 'static,
  R: Send + 'static,
{
  pub fn new<F, Fut>(
    store: Arc<EntryStore>,
    name: impl Into<String>,
    mutation_fn: F,
    retry: RetryPolicy,
    sink: Arc<dyn NotificationSink>,
  ) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    Self {
      store,
      name: name.into(),
      mutation_fn: Arc::new(move |input| mutation_fn(input).boxed()),
      optimistic: None,
      on_success: None,
      affected: Vec::new(),
      retry,
      sink,
    }
  }

  /// Declare a key (or prefix) this mutation changes on the server.
  pub fn affects(mut self, key: CacheKey) -> Self {
    self.affected.push(key);
    self
  }

  /// Speculative local change applied before the mutation function runs.
  pub fn optimistic<F>(mut self, f: F) -> Self
  where
    F: Fn(&I, &mut OptimisticWrite<'_>) + Send + Sync + 'static,
  {
    self.optimistic = Some(Arc::new(f));
    self
  }

  /// Write derived from the server's response, applied just before settlement.
  pub fn on_success<F>(mut self, f: F) -> Self
  where
    F: Fn(&R, &mut OptimisticWrite<'_>) + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn retries(mut self, max_retries: u32) -> Self {
    self.retry.max_retries = max_retries;
    self
  }

  pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
    self.sink = sink;
    self
  }

  pub fn build(self) -> Mutation<I, R> {
    Mutation {
      store: self.store,
      name: self.name.into(),
      mutation_fn: self.mutation_fn,
      optimistic: self.optimistic,
      on_success: self.on_success,
      affected: self.affected.into(),
      retry: self.retry,
      sink: self.sink,
      status: Arc::new(Mutex::new(MutationStatus::Idle)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;
  use tokio::sync::oneshot;

  #[derive(Default)]
  struct RecordingSink {
    failures: AtomicU32,
    successes: AtomicU32,
  }

  impl NotificationSink for RecordingSink {
    fn mutation_succeeded(&self, _name: &str) {
      self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn mutation_failed(&self, _name: &str, _error: &Report) {
      self.failures.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn store() -> Arc<EntryStore> {
    Arc::new(EntryStore::new(
      QueryOptions::default().with_stale_time(Duration::from_secs(60)),
    ))
  }

  fn list_key() -> CacheKey {
    CacheKey::from(["items", "list"])
  }

  fn list(store: &EntryStore) -> Vec<&'static str> {
    store.read(&list_key()).unwrap().data().unwrap()
  }

  fn append(store: &Arc<EntryStore>, sink: Arc<dyn NotificationSink>, fail: bool) -> Mutation<&'static str, ()> {
    MutationBuilder::new(
      Arc::clone(store),
      "append",
      move |_item: &'static str| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if fail {
          Err(eyre!("rejected"))
        } else {
          Ok(())
        }
      },
      RetryPolicy::NONE,
      sink,
    )
    .affects(CacheKey::from(["items"]))
    .optimistic(|item, write| {
      write.update::<Vec<&'static str>, _>(&list_key(), |old| {
        let mut next = old.unwrap_or_default();
        next.push(*item);
        next
      });
    })
    .build()
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_value_visible_before_settlement() {
    let store = store();
    store.write(&list_key(), vec!["A", "B"], QueryStatus::Success);
    let mutation = append(&store, Arc::new(TracingSink), false);

    let pending = mutation.mutate("C");
    tokio::pin!(pending);
    assert!(futures::poll!(pending.as_mut()).is_pending());
    assert_eq!(list(&store), vec!["A", "B", "C"]);
    assert!(mutation.is_pending());

    pending.await.unwrap();
    assert_eq!(mutation.status(), MutationStatus::Success);
    assert!(store.read(&list_key()).unwrap().is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_restores_snapshot_and_invalidates() {
    let store = store();
    store.write(&list_key(), vec!["A", "B"], QueryStatus::Success);
    let sink = Arc::new(RecordingSink::default());
    let mutation = append(&store, sink.clone(), true);

    let err = mutation.mutate("C").await.unwrap_err();
    assert_eq!(err.to_string(), "rejected");
    assert_eq!(list(&store), vec!["A", "B"]);
    assert!(store.read(&list_key()).unwrap().is_stale());
    assert_eq!(mutation.status(), MutationStatus::Error);
    assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
    assert_eq!(sink.successes.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_mutations_chain_snapshots() {
    let store = store();
    store.write(&list_key(), vec!["A"], QueryStatus::Success);
    let first = append(&store, Arc::new(TracingSink), false);

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    let second = MutationBuilder::new(
      Arc::clone(&store),
      "append-slow",
      move |_item: &'static str| {
        let rx = release_rx.lock().unwrap().take();
        async move {
          if let Some(rx) = rx {
            let _ = rx.await;
          }
          Err::<(), _>(eyre!("rejected"))
        }
      },
      RetryPolicy::NONE,
      Arc::new(TracingSink),
    )
    .affects(list_key())
    .optimistic(|item, write| {
      write.update::<Vec<&'static str>, _>(&list_key(), |old| {
        let mut next = old.unwrap_or_default();
        next.push(*item);
        next
      });
    })
    .build();

    let first_pending = first.mutate("B");
    tokio::pin!(first_pending);
    assert!(futures::poll!(first_pending.as_mut()).is_pending());

    let second_pending = second.mutate("C");
    tokio::pin!(second_pending);
    assert!(futures::poll!(second_pending.as_mut()).is_pending());
    assert_eq!(list(&store), vec!["A", "B", "C"]);

    release_tx.send(()).unwrap();
    assert!(second_pending.await.is_err());
    // Rolled back to the first mutation's optimistic value.
    assert_eq!(list(&store), vec!["A", "B"]);

    first_pending.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_mutation_still_settles() {
    let store = store();
    store.write(&list_key(), vec!["A"], QueryStatus::Success);
    let mutation = append(&store, Arc::new(TracingSink), false);

    {
      let pending = mutation.mutate("B");
      tokio::pin!(pending);
      assert!(futures::poll!(pending.as_mut()).is_pending());
      assert_eq!(list(&store), vec!["A", "B"]);
    }

    assert_eq!(list(&store), vec!["A"]);
    assert!(store.read(&list_key()).unwrap().is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_matching_patches_every_variant() {
    let store = store();
    let active = CacheKey::from(["items", "list"]).child("active");
    let all = CacheKey::from(["items", "list"]).child("all");
    store.write(&active, vec![1u32], QueryStatus::Success);
    store.write(&all, vec![1u32, 2], QueryStatus::Success);
    store.write(&CacheKey::from(["items", "count"]), 2usize, QueryStatus::Success);

    let mutation: Mutation<u32, ()> = MutationBuilder::new(
      Arc::clone(&store),
      "remove",
      |_id: u32| async { Err(eyre!("offline")) },
      RetryPolicy::NONE,
      Arc::new(TracingSink),
    )
    .optimistic(|id, write| {
      let changed = write.update_matching::<Vec<u32>, _>(&CacheKey::from(["items"]), |list| {
        list.into_iter().filter(|x| x != id).collect()
      });
      assert_eq!(changed, 2);
    })
    .build();

    assert!(mutation.mutate(1).await.is_err());
    // Undeclared but touched keys are restored and invalidated too.
    assert_eq!(store.read(&active).unwrap().data::<Vec<u32>>(), Some(vec![1]));
    assert_eq!(store.read(&all).unwrap().data::<Vec<u32>>(), Some(vec![1, 2]));
    assert!(store.read(&active).unwrap().is_stale());
    assert!(!store.read(&CacheKey::from(["items", "count"])).unwrap().is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_on_success_writes_server_result() {
    let store = store();
    let user = CacheKey::from(["auth", "currentUser"]);
    let login: Mutation<String, String> = MutationBuilder::new(
      Arc::clone(&store),
      "login",
      |name: String| async move { Ok(format!("user:{}", name)) },
      RetryPolicy::NONE,
      Arc::new(TracingSink),
    )
    .affects(user.clone())
    .on_success({
      let user = user.clone();
      move |result, write| write.set(&user, Some(result.clone()))
    })
    .build();

    assert_eq!(login.mutate("ada".to_string()).await.unwrap(), "user:ada");
    let state = store.read(&user).unwrap();
    assert_eq!(state.data::<Option<String>>(), Some(Some("user:ada".to_string())));
    assert!(state.is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_mutation_once_by_default() {
    let store = store();
    let calls = Arc::new(AtomicU32::new(0));
    let mutation: Mutation<(), ()> = MutationBuilder::new(
      Arc::clone(&store),
      "flaky",
      {
        let calls = Arc::clone(&calls);
        move |_: ()| {
          let n = calls.fetch_add(1, Ordering::SeqCst);
          async move {
            if n == 0 {
              Err(eyre!("transient"))
            } else {
              Ok(())
            }
          }
        }
      },
      RetryPolicy::for_mutations(&crate::config::CacheConfig::default()),
      Arc::new(TracingSink),
    )
    .build();

    mutation.mutate(()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
