//! Core traits for keys and cached entities.

use super::key::CacheKey;

/// Typed key factory for one family of queries.
///
/// Implementors map a domain-level description of a query (e.g. "scholarship list with
/// these filters") onto the hierarchical [`CacheKey`] the cache stores it under.
pub trait QueryKey {
  /// Hierarchical address of this query.
  fn cache_key(&self) -> CacheKey;

  /// Human readable description for status lines and logs.
  fn description(&self) -> String;
}

impl QueryKey for CacheKey {
  fn cache_key(&self) -> CacheKey {
    self.clone()
  }

  fn description(&self) -> String {
    self.serialize()
  }
}

/// Prefix of identities assigned locally before the server has returned a real one.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Trait for entities that live inside cached collections.
///
/// Implementors must provide a stable identity so optimistic updates can patch or
/// remove a single element, and so a selection can refer to elements across refetches.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (server id, or a placeholder).
  fn cache_key(&self) -> String;

  /// Last modification timestamp (ISO 8601), if the entity tracks one.
  fn updated_at(&self) -> Option<&str> {
    None
  }

  /// True while the entity carries a locally assigned identity.
  fn is_placeholder(&self) -> bool {
    self.cache_key().starts_with(PLACEHOLDER_PREFIX)
  }
}
