//! Predicate filtering and text search over a collection.

use super::Fields;

/// Keep the items matching `predicate`, in input order.
pub fn filter<T, P>(items: &[T], predicate: P) -> Vec<T>
where
  T: Clone,
  P: Fn(&T) -> bool,
{
  items.iter().filter(|item| predicate(item)).cloned().collect()
}

/// How [`search`] matches the search term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
  pub case_sensitive: bool,
  /// Whole-field equality instead of substring match
  pub exact_match: bool,
  /// Terms shorter than this (in characters) do not filter at all
  pub min_search_length: usize,
}

/// Items where any of `fields` matches `term`.
///
/// An empty term, or one shorter than `min_search_length`, returns the input unchanged.
/// Only text fields take part in matching.
pub fn search<T, S>(items: &[T], term: &str, fields: &[S], options: &SearchOptions) -> Vec<T>
where
  T: Fields + Clone,
  S: AsRef<str>,
{
  if term.is_empty() || term.chars().count() < options.min_search_length {
    return items.to_vec();
  }

  let needle = normalize(term, options.case_sensitive);
  items
    .iter()
    .filter(|item| {
      fields.iter().any(|field| {
        let Some(value) = item.field(field.as_ref()) else {
          return false;
        };
        let Some(text) = value.as_text() else {
          return false;
        };
        let haystack = normalize(text, options.case_sensitive);
        if options.exact_match {
          haystack == needle
        } else {
          haystack.contains(&needle)
        }
      })
    })
    .cloned()
    .collect()
}

fn normalize(text: &str, case_sensitive: bool) -> String {
  if case_sensitive {
    text.to_string()
  } else {
    text.to_lowercase()
  }
}
