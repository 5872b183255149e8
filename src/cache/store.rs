//! Entry Store: the single shared mutable map from key to entry.
//!
//! Every operation takes the store mutex once, so no reader can observe a half-applied
//! write: value, status, timestamps and deadlines of an entry always change together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::entry::{AnyValue, Entry, EntryState, QueryOptions, QueryStatus};
use super::key::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Mutable state behind the store mutex.
pub(crate) struct StoreInner {
  entries: HashMap<String, Entry>,
  /// Store-wide write sequence. Every write draws a fresh, larger number.
  last_seq: u64,
  /// Bumped on every full clear so work started in an earlier session is dropped.
  generation: u64,
  last_entry_id: u64,
}

impl StoreInner {
  pub fn next_seq(&mut self) -> u64 {
    self.last_seq += 1;
    self.last_seq
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn get(&self, key: &CacheKey) -> Option<&Entry> {
    self.entries.get(&key.serialize())
  }

  pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut Entry> {
    self.entries.get_mut(&key.serialize())
  }

  /// Get the entry for `key`, creating an idle one if absent.
  pub fn entry_mut(&mut self, key: &CacheKey, options: &QueryOptions, now: Instant) -> &mut Entry {
    let last_entry_id = &mut self.last_entry_id;
    self.entries.entry(key.serialize()).or_insert_with(|| {
      *last_entry_id += 1;
      let mut entry = Entry::new(key.clone(), options, now);
      entry.id = *last_entry_id;
      entry
    })
  }

  /// Keys of every entry equal to or descending from `prefix`.
  pub fn matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self
      .entries
      .values()
      .filter(|entry| prefix.is_ancestor_of(&entry.key))
      .map(|entry| entry.key.clone())
      .collect()
  }

  /// Write a value under a fresh sequence number.
  pub fn write(
    &mut self,
    key: &CacheKey,
    value: Option<AnyValue>,
    status: QueryStatus,
    options: &QueryOptions,
    now: Instant,
  ) -> u64 {
    let seq = self.next_seq();
    self.entry_mut(key, options, now).write(value, status, seq, now);
    seq
  }

  /// Detach the in-flight fetch for `key`, if any.
  ///
  /// The request keeps running and its joined callers still receive its outcome, but
  /// the sequence number moves past it so its write is discarded.
  pub fn supersede_fetch(&mut self, key: &CacheKey) -> bool {
    let seq = self.next_seq();
    let Some(entry) = self.get_mut(key) else {
      return false;
    };
    let Some(flight) = entry.in_flight.take() else {
      return false;
    };
    entry.applied_seq = entry.applied_seq.max(seq);
    entry.settle_status();
    entry.notify();
    debug!(key = %key, seq = flight.seq, "Superseded in-flight fetch");
    true
  }

  pub fn invalidate(&mut self, prefix: &CacheKey, now: Instant) -> usize {
    let mut count = 0;
    for entry in self.entries.values_mut() {
      if prefix.is_ancestor_of(&entry.key) {
        entry.stale_at = now;
        entry.notify();
        count += 1;
      }
    }
    count
  }
}

/// The process-wide (per session) cache of entries.
pub struct EntryStore {
  inner: Mutex<StoreInner>,
  defaults: QueryOptions,
}

impl EntryStore {
  pub fn new(defaults: QueryOptions) -> Self {
    Self {
      inner: Mutex::new(StoreInner {
        entries: HashMap::new(),
        last_seq: 0,
        generation: 0,
        last_entry_id: 0,
      }),
      defaults,
    }
  }

  pub fn defaults(&self) -> &QueryOptions {
    &self.defaults
  }

  pub(crate) fn lock(&self, op: &'static str) -> MutexGuard<'_, StoreInner> {
    mutex_lock(&self.inner, SOURCE, op)
  }

  /// Snapshot of the entry for `key`. No side effects.
  pub fn read(&self, key: &CacheKey) -> Option<EntryState> {
    self.lock("read").get(key).map(Entry::state)
  }

  /// Replace value and status for `key` and restart its stale and gc deadlines.
  pub fn write<V: Send + Sync + 'static>(&self, key: &CacheKey, value: V, status: QueryStatus) {
    let value: AnyValue = Arc::new(value);
    self.write_any(key, Some(value), status);
  }

  pub(crate) fn write_any(&self, key: &CacheKey, value: Option<AnyValue>, status: QueryStatus) {
    let now = Instant::now();
    let seq = self
      .lock("write")
      .write(key, value, status, &self.defaults, now);
    debug!(key = %key, seq, ?status, "Wrote entry");
  }

  /// Register interest in `key`. The entry cannot be evicted while subscribed.
  pub fn subscribe(self: &Arc<Self>, key: &CacheKey, options: &QueryOptions) -> Subscription {
    let now = Instant::now();
    let (entry_id, changes) = {
      let mut inner = self.lock("subscribe");
      let entry = inner.entry_mut(key, options, now);
      entry.apply_options(options);
      entry.subscriber_count += 1;
      (entry.id, entry.changes.subscribe())
    };
    Subscription {
      store: Arc::clone(self),
      key: key.clone(),
      entry_id,
      changes,
    }
  }

  /// Drop one subscriber from the entry the subscription counted. An entry removed and
  /// created again under the same key is a different entry and is left alone.
  fn release(&self, key: &CacheKey, entry_id: u64) {
    let now = Instant::now();
    let mut inner = self.lock("unsubscribe");
    if let Some(entry) = inner.get_mut(key).filter(|entry| entry.id == entry_id) {
      entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
      if entry.subscriber_count == 0 {
        entry.gc_at = now + entry.gc_time;
      }
    }
  }

  /// Mark every entry under `prefix` stale without touching its data.
  pub fn invalidate(&self, prefix: &CacheKey) -> usize {
    let count = self.lock("invalidate").invalidate(prefix, Instant::now());
    debug!(prefix = %prefix, count, "Invalidated entries");
    count
  }

  /// Hard delete one entry.
  pub fn remove(&self, key: &CacheKey) -> bool {
    self
      .lock("remove")
      .entries
      .remove(&key.serialize())
      .is_some()
  }

  /// Hard delete every entry under `prefix`.
  pub fn remove_matching(&self, prefix: &CacheKey) -> usize {
    let mut inner = self.lock("remove_matching");
    let before = inner.entries.len();
    inner
      .entries
      .retain(|_, entry| !prefix.is_ancestor_of(&entry.key));
    before - inner.entries.len()
  }

  /// Drop everything. Fetches and rollbacks started before the clear are discarded.
  pub fn clear(&self) -> usize {
    let mut inner = self.lock("clear");
    let removed = inner.entries.len();
    inner.entries.clear();
    inner.generation += 1;
    info!(removed, generation = inner.generation, "Cleared query cache");
    removed
  }

  /// Remove entries that are unobserved, idle on the network and past their gc deadline.
  pub fn evict_expired(&self, now: Instant) -> Vec<CacheKey> {
    let mut inner = self.lock("evict_expired");
    let expired: Vec<String> = inner
      .entries
      .iter()
      .filter(|(_, entry)| {
        entry.subscriber_count == 0 && entry.in_flight.is_none() && now >= entry.gc_at
      })
      .map(|(canonical, _)| canonical.clone())
      .collect();

    expired
      .into_iter()
      .filter_map(|canonical| inner.entries.remove(&canonical))
      .map(|entry| entry.key)
      .collect()
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    self.lock("keys").matching(&CacheKey::root())
  }

  pub fn len(&self) -> usize {
    self.lock("len").entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for EntryStore {
  fn default() -> Self {
    Self::new(QueryOptions::default())
  }
}

/// Interest in one key. Dropping it unsubscribes.
pub struct Subscription {
  store: Arc<EntryStore>,
  key: CacheKey,
  entry_id: u64,
  changes: watch::Receiver<u64>,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Receiver bumped on every change to the entry.
  pub fn changes(&mut self) -> &mut watch::Receiver<u64> {
    &mut self.changes
  }

  pub fn unsubscribe(self) {
    drop(self);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.store.release(&self.key, self.entry_id);
  }
}
