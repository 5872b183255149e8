//! Local memoization for derived views.
//!
//! These caches belong to a single call site and are unrelated to the query cache: they
//! are never invalidated by mutations and never shared.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use tracing::debug;

/// Bounded memo keyed by the JSON serialization of the arguments.
///
/// Eviction is strict LRU: a hit refreshes the entry, and a full cache drops the entry
/// whose last access is oldest.
pub struct ComputationCache<V> {
  entries: LruCache<String, V>,
}

impl<V: Clone> ComputationCache<V> {
  /// A capacity of 0 is treated as 1.
  pub fn new(max_size: usize) -> Self {
    let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: LruCache::new(capacity),
    }
  }

  /// Cached result for `args`, computing and storing it on a miss.
  ///
  /// Arguments that cannot be serialized are computed every time.
  pub fn get_or_compute<A, F>(&mut self, args: &A, compute: F) -> V
  where
    A: Serialize + ?Sized,
    F: FnOnce(&A) -> V,
  {
    let key = match serde_json::to_string(args) {
      Ok(key) => key,
      Err(err) => {
        debug!(error = %err, "Arguments are not serializable, skipping memo");
        return compute(args);
      }
    };
    if let Some(hit) = self.entries.get(&key) {
      return hit.clone();
    }
    let value = compute(args);
    self.entries.put(key, value.clone());
    value
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

/// Single-slot memo that recomputes only when its dependencies change.
#[derive(Debug, Clone, Default)]
pub struct Memo<D, V> {
  slot: Option<(D, V)>,
}

impl<D: PartialEq, V> Memo<D, V> {
  pub fn new() -> Self {
    Self { slot: None }
  }

  pub fn get(&mut self, deps: D, compute: impl FnOnce(&D) -> V) -> &V {
    if !matches!(&self.slot, Some((current, _)) if *current == deps) {
      self.slot = None;
    }
    let (_, value) = self.slot.get_or_insert_with(|| {
      let value = compute(&deps);
      (deps, value)
    });
    value
  }

  pub fn reset(&mut self) {
    self.slot = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  #[test]
  fn test_hits_do_not_recompute() {
    let calls = Cell::new(0);
    let mut cache = ComputationCache::new(2);
    let square = |n: &u32| {
      calls.set(calls.get() + 1);
      n * n
    };
    assert_eq!(cache.get_or_compute(&3, square), 9);
    assert_eq!(cache.get_or_compute(&3, square), 9);
    assert_eq!(calls.get(), 1);
  }

  #[test]
  fn test_evicts_least_recently_used() {
    let calls = Cell::new(0);
    let mut cache = ComputationCache::new(2);
    let double = |n: &u32| {
      calls.set(calls.get() + 1);
      n * 2
    };
    cache.get_or_compute(&1, double);
    cache.get_or_compute(&2, double);
    // Touch 1 so that 2 becomes the oldest.
    cache.get_or_compute(&1, double);
    cache.get_or_compute(&3, double);
    assert_eq!(calls.get(), 3);

    cache.get_or_compute(&1, double);
    assert_eq!(calls.get(), 3);
    cache.get_or_compute(&2, double);
    assert_eq!(calls.get(), 4);
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_structured_arguments_are_keys() {
    let mut cache = ComputationCache::new(4);
    let total = |args: &(Vec<u32>, bool)| args.0.iter().sum::<u32>() + u32::from(args.1);
    assert_eq!(cache.get_or_compute(&(vec![1, 2], false), total), 3);
    assert_eq!(cache.get_or_compute(&(vec![1, 2], true), total), 4);
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_memo_recomputes_on_dependency_change() {
    let calls = Cell::new(0);
    let mut memo = Memo::new();
    let len = |deps: &(&str, u8)| {
      calls.set(calls.get() + 1);
      deps.0.len() + usize::from(deps.1)
    };
    assert_eq!(*memo.get(("abc", 0), len), 3);
    assert_eq!(*memo.get(("abc", 0), len), 3);
    assert_eq!(*memo.get(("abc", 1), len), 4);
    assert_eq!(calls.get(), 2);
  }
}
