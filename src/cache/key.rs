//! Hierarchical cache keys.
//!
//! A key is an ordered list of JSON segments, e.g.
//! `["scholarships", "list", {"filters": {"status": "ACTIVE"}}]`. Equality is defined
//! on the canonical serialization, where object members are written with their names
//! sorted, so two attribute maps built in a different order address the same entry.

use serde::{Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Address of one cached value, and the invalidation scope for its descendants.
#[derive(Clone)]
pub struct CacheKey {
  segments: Vec<Value>,
  /// Canonical form of each segment, computed once at construction.
  canonical: Vec<String>,
}

impl CacheKey {
  /// Build a key from homogeneous segments.
  ///
  /// ```ignore
  /// let key = CacheKey::new(["scholarships", "list"]);
  /// ```
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<Value>,
  {
    let segments: Vec<Value> = segments.into_iter().map(Into::into).collect();
    let canonical = segments.iter().map(canonical_segment).collect();
    Self {
      segments,
      canonical,
    }
  }

  /// The empty key. It is an ancestor of every key.
  pub fn root() -> Self {
    Self::new(Vec::<Value>::new())
  }

  /// Return a new key with one more segment appended.
  pub fn child(&self, segment: impl Into<Value>) -> Self {
    let segment = segment.into();
    let mut next = self.clone();
    next.canonical.push(canonical_segment(&segment));
    next.segments.push(segment);
    next
  }

  /// Append a serializable parameter object (filters, ids, ...) as a segment.
  pub fn try_child<T: Serialize>(&self, params: &T) -> Result<Self, serde_json::Error> {
    Ok(self.child(serde_json::to_value(params)?))
  }

  pub fn segments(&self) -> &[Value] {
    &self.segments
  }

  pub fn len(&self) -> usize {
    self.segments.len()
  }

  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }

  /// Canonical serialization. Two keys are equal iff these strings are equal.
  pub fn serialize(&self) -> String {
    let mut out = String::with_capacity(2 + self.canonical.iter().map(|s| s.len() + 1).sum::<usize>());
    out.push('[');
    out.push_str(&self.canonical.join(","));
    out.push(']');
    out
  }

  /// True iff this key's segments are a prefix of `other`'s (a key is its own ancestor).
  pub fn is_ancestor_of(&self, other: &CacheKey) -> bool {
    self.canonical.len() <= other.canonical.len()
      && self
        .canonical
        .iter()
        .zip(&other.canonical)
        .all(|(a, b)| a == b)
  }

  /// SHA-256 of the canonical form, hex encoded. Stable across runs; used in logs.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.serialize().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Free-function form of [`CacheKey::is_ancestor_of`].
pub fn is_ancestor(prefix: &CacheKey, key: &CacheKey) -> bool {
  prefix.is_ancestor_of(key)
}

impl PartialEq for CacheKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.serialize())
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self.serialize())
  }
}

impl Serialize for CacheKey {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.segments.serialize(serializer)
  }
}

impl<const N: usize> From<[&str; N]> for CacheKey {
  fn from(segments: [&str; N]) -> Self {
    CacheKey::new(segments)
  }
}

impl From<&[&str]> for CacheKey {
  fn from(segments: &[&str]) -> Self {
    CacheKey::new(segments.iter().copied())
  }
}

fn canonical_segment(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

/// Compact JSON with object members sorted by name, independent of map insertion order.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut fields: Vec<_> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (name, field)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(field, out);
      }
      out.push('}');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}
