//! Keyed query cache with optimistic mutations.
//!
//! This module provides a transport-agnostic caching layer that:
//! - Stores fetched values under hierarchical keys, with per-entry stale and gc deadlines
//! - Deduplicates concurrent fetches for the same key and retries failures
//! - Applies optimistic updates, rolls them back on failure and reconciles on settlement
//! - Evicts unobserved entries in the background

mod client;
mod entry;
mod error;
mod fetch;
mod gc;
mod key;
pub(crate) mod lock;
mod mutation;
pub mod optimistic;
mod retry;
mod store;
mod traits;

pub use client::QueryClient;
pub use entry::{EntryState, QueryOptions, QueryStatus};
pub use error::{QueryError, SharedReport};
pub use fetch::FetchCoordinator;
pub use gc::EvictionScheduler;
pub use key::{is_ancestor, CacheKey};
pub use mutation::{
  Mutation, MutationBuilder, MutationStatus, NotificationSink, OptimisticWrite, TracingSink,
};
pub use retry::{Exhausted, RetryPolicy};
pub use store::{EntryStore, Subscription};
pub use traits::{Cacheable, QueryKey, PLACEHOLDER_PREFIX};
