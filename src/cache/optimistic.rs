//! Helpers for optimistic updaters over cached collections.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::{Cacheable, PLACEHOLDER_PREFIX};

static PLACEHOLDER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A locally assigned identity for an entity the server has not created yet.
///
/// Unique within the process even when generated in the same millisecond.
pub fn placeholder_id() -> String {
  let n = PLACEHOLDER_COUNTER.fetch_add(1, Ordering::Relaxed);
  format!("{}{}-{}", PLACEHOLDER_PREFIX, Utc::now().timestamp_millis(), n)
}

/// Put `item` at the front of `list`.
pub fn prepend<T: Cacheable>(list: Option<Vec<T>>, item: T) -> Vec<T> {
  let mut next = Vec::with_capacity(list.as_ref().map_or(0, Vec::len) + 1);
  next.push(item);
  next.extend(list.unwrap_or_default());
  next
}

/// Replace the element whose identity is `id` with `patch(element)`.
pub fn replace_by_key<T, F>(list: Vec<T>, id: &str, patch: F) -> Vec<T>
where
  T: Cacheable,
  F: Fn(T) -> T,
{
  list
    .into_iter()
    .map(|item| if item.cache_key() == id { patch(item) } else { item })
    .collect()
}

/// Drop the element whose identity is `id`.
pub fn remove_by_key<T: Cacheable>(list: Vec<T>, id: &str) -> Vec<T> {
  list.into_iter().filter(|item| item.cache_key() != id).collect()
}
