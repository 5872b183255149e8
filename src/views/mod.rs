//! Derived views over cached collections.
//!
//! Everything here is a pure, synchronous transformation of a slice the caller already
//! holds (usually the data of a [`crate::query::QueryObserver`]). Nothing in this module
//! reads or writes the cache.

pub mod debounce;
pub mod filter;
pub mod memo;
pub mod paginate;
pub mod selection;
pub mod sort;
pub mod virtualize;

use chrono::{DateTime, Utc};

pub use debounce::{Debounced, DebouncedCallback};
pub use filter::{filter, search, SearchOptions};
pub use memo::{ComputationCache, Memo};
pub use paginate::{paginate, Page};
pub use selection::BulkSelection;
pub use sort::{sort_by_field, sort_with, SortOrder};
pub use virtualize::{virtualize_window, VirtualWindow};

/// A field value as seen by the generic sort and search views.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  Text(String),
  Number(f64),
  Date(DateTime<Utc>),
}

impl FieldValue {
  pub fn as_text(&self) -> Option<&str> {
    match self {
      FieldValue::Text(text) => Some(text),
      _ => None,
    }
  }
}

impl std::fmt::Display for FieldValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FieldValue::Text(text) => f.write_str(text),
      FieldValue::Number(n) => write!(f, "{}", n),
      FieldValue::Date(date) => write!(f, "{}", date.to_rfc3339()),
    }
  }
}

/// Named field access for items shown through sort and search views.
pub trait Fields {
  /// Value of the field called `name`, or `None` if the item has no such field or it is
  /// empty.
  fn field(&self, name: &str) -> Option<FieldValue>;
}
