//! Query keys for portal data.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::{CacheKey, QueryKey};
use crate::views::{paginate, search, sort_by_field, Page, SearchOptions, SortOrder};

use super::types::{Scholarship, ScholarshipStatus};

/// Sort choices offered by the scholarship list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScholarshipSort {
  Newest,
  Oldest,
  Deadline,
  Applicants,
  Name,
}

impl ScholarshipSort {
  fn field_and_order(self) -> (&'static str, SortOrder) {
    match self {
      ScholarshipSort::Newest => ("createdAt", SortOrder::Desc),
      ScholarshipSort::Oldest => ("createdAt", SortOrder::Asc),
      ScholarshipSort::Deadline => ("deadline", SortOrder::Asc),
      ScholarshipSort::Applicants => ("applicants", SortOrder::Desc),
      ScholarshipSort::Name => ("title", SortOrder::Asc),
    }
  }
}

/// Filters for one variant of the scholarship list.
///
/// Each distinct filter set is cached under its own key below `["scholarships", "list"]`.
/// Unset fields are left out of the key, so the default filters serialize to `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScholarshipFilters {
  /// `None` lists every status
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<ScholarshipStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search_term: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub sort_by: Option<ScholarshipSort>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<usize>,
}

/// Fields matched by the free-text search.
pub const SEARCH_FIELDS: [&str; 4] = ["title", "description", "location", "type"];

impl ScholarshipFilters {
  /// Run the filter, search, sort and page steps over a fetched list.
  ///
  /// Without a limit the whole result is one page.
  pub fn apply(&self, items: &[Scholarship]) -> Page<Scholarship> {
    let matching: Vec<Scholarship> = match self.status {
      Some(status) => crate::views::filter(items, |s| s.status == status),
      None => items.to_vec(),
    };
    let found = match &self.search_term {
      Some(term) => search(&matching, term, &SEARCH_FIELDS, &SearchOptions::default()),
      None => matching,
    };
    let sorted = match self.sort_by {
      Some(sort) => {
        let (field, order) = sort.field_and_order();
        sort_by_field(&found, Some(field), order)
      }
      None => found,
    };
    let limit = self.limit.unwrap_or(sorted.len().max(1));
    paginate(&sorted, self.page.unwrap_or(1), limit)
  }
}

/// Keys under `["scholarships", ...]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScholarshipKey {
  /// Every scholarship query
  All,
  /// Every list variant
  Lists,
  /// One list variant
  List(ScholarshipFilters),
  Details,
  Detail(String),
  Archived,
  Statistics,
}

impl QueryKey for ScholarshipKey {
  fn cache_key(&self) -> CacheKey {
    let all = CacheKey::new(["scholarships"]);
    match self {
      Self::All => all,
      Self::Lists => all.child("list"),
      Self::List(filters) => {
        let filters = serde_json::to_value(filters).unwrap_or(Value::Null);
        all.child("list").child(json!({ "filters": filters }))
      }
      Self::Details => all.child("detail"),
      Self::Detail(id) => all.child("detail").child(id.as_str()),
      Self::Archived => all.child("archived"),
      Self::Statistics => all.child("statistics"),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::All => "all scholarship data".to_string(),
      Self::Lists => "scholarship lists".to_string(),
      Self::List(filters) if *filters == ScholarshipFilters::default() => {
        "all scholarships".to_string()
      }
      Self::List(filters) => format!("scholarships matching {:?}", filters),
      Self::Details => "scholarship details".to_string(),
      Self::Detail(id) => format!("scholarship {}", id),
      Self::Archived => "archived scholarships".to_string(),
      Self::Statistics => "scholarship statistics".to_string(),
    }
  }
}

/// Keys under `["auth", ...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKey {
  All,
  CurrentUser,
  Sessions,
}

impl QueryKey for AuthKey {
  fn cache_key(&self) -> CacheKey {
    let all = CacheKey::new(["auth"]);
    match self {
      Self::All => all,
      Self::CurrentUser => all.child("currentUser"),
      Self::Sessions => all.child("sessions"),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::All => "all auth data".to_string(),
      Self::CurrentUser => "current user".to_string(),
      Self::Sessions => "sessions".to_string(),
    }
  }
}
