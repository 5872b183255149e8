use std::collections::BTreeSet;

use crate::cache::Cacheable;

/// Set of selected entity ids for bulk actions.
///
/// Ids outlive refetches: an item replaced by a fresh copy with the same identity stays
/// selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSelection {
  selected: BTreeSet<String>,
}

impl BulkSelection {
  pub fn new() -> Self {
    Self::default()
  }

  /// Select `id` if unselected, otherwise unselect it. Returns the new membership.
  pub fn toggle(&mut self, id: &str) -> bool {
    if self.selected.remove(id) {
      false
    } else {
      self.selected.insert(id.to_string());
      true
    }
  }

  /// Replace the selection with every item in `items`.
  pub fn select_all<T: Cacheable>(&mut self, items: &[T]) {
    self.selected = items.iter().map(Cacheable::cache_key).collect();
  }

  /// Add `ids` to the selection.
  pub fn select_many<I, S>(&mut self, ids: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.selected.extend(ids.into_iter().map(Into::into));
  }

  pub fn clear(&mut self) {
    self.selected.clear();
  }

  pub fn is_selected(&self, id: &str) -> bool {
    self.selected.contains(id)
  }

  pub fn count(&self) -> usize {
    self.selected.len()
  }

  pub fn has_selection(&self) -> bool {
    !self.selected.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.selected.iter().map(String::as_str)
  }

  /// The selected members of `items`, in input order.
  pub fn selected_items<T: Cacheable>(&self, items: &[T]) -> Vec<T> {
    items
      .iter()
      .filter(|item| self.selected.contains(&item.cache_key()))
      .cloned()
      .collect()
  }
}
