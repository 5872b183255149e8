//! Stable sorting by named field or custom comparator.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::{FieldValue, Fields};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

impl SortOrder {
  fn apply(self, ordering: Ordering) -> Ordering {
    match self {
      SortOrder::Asc => ordering,
      SortOrder::Desc => ordering.reverse(),
    }
  }
}

/// Sort a copy of `items` by the field called `field`.
///
/// Numbers compare numerically, dates by instant and text case-insensitively (lowercase
/// first on ties). Mixed kinds compare by their display form; missing values sort after
/// present ones. Equal items keep their input order in both directions. With no field
/// the input is returned as is.
pub fn sort_by_field<T: Fields + Clone>(
  items: &[T],
  field: Option<&str>,
  order: SortOrder,
) -> Vec<T> {
  let Some(field) = field else {
    return items.to_vec();
  };
  sort_with(items, order, |a, b| compare_fields(a.field(field), b.field(field)))
}

/// Sort a copy of `items` with a custom comparator, reversed for [`SortOrder::Desc`].
pub fn sort_with<T, F>(items: &[T], order: SortOrder, compare: F) -> Vec<T>
where
  T: Clone,
  F: Fn(&T, &T) -> Ordering,
{
  let mut sorted = items.to_vec();
  sorted.sort_by(|a, b| order.apply(compare(a, b)));
  sorted
}

fn compare_fields(a: Option<FieldValue>, b: Option<FieldValue>) -> Ordering {
  match (a, b) {
    (Some(a), Some(b)) => compare_values(&a, &b),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  }
}

pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
  match (a, b) {
    (FieldValue::Number(a), FieldValue::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    (FieldValue::Date(a), FieldValue::Date(b)) => a.cmp(b),
    (FieldValue::Text(a), FieldValue::Text(b)) => compare_text(a, b),
    (a, b) => compare_text(&a.to_string(), &b.to_string()),
  }
}

/// Approximates locale collation: letters compare ignoring case, lowercase wins ties.
///
/// Case folding is the only normalization. Accented letters are not collated with their
/// base letter and order by code point, so `"Élan"` sorts after `"Zeta"`.
fn compare_text(a: &str, b: &str) -> Ordering {
  a.to_lowercase()
    .cmp(&b.to_lowercase())
    .then_with(|| b.cmp(a))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  #[derive(Debug, Clone, PartialEq)]
  struct Row {
    id: u32,
    title: &'static str,
    amount: Option<f64>,
    deadline: chrono::DateTime<Utc>,
  }

  impl Fields for Row {
    fn field(&self, name: &str) -> Option<FieldValue> {
      match name {
        "title" => Some(FieldValue::Text(self.title.to_string())),
        "amount" => self.amount.map(FieldValue::Number),
        "deadline" => Some(FieldValue::Date(self.deadline)),
        _ => None,
      }
    }
  }

  fn row(id: u32, title: &'static str, amount: Option<f64>, day: u32) -> Row {
    Row {
      id,
      title,
      amount,
      deadline: Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap(),
    }
  }

  fn ids(rows: &[Row]) -> Vec<u32> {
    rows.iter().map(|r| r.id).collect()
  }

  fn rows() -> Vec<Row> {
    vec![
      row(1, "beta", Some(900.0), 20),
      row(2, "Alpha", Some(10000.0), 5),
      row(3, "alpha", None, 12),
      row(4, "Gamma", Some(900.0), 1),
    ]
  }

  #[test]
  fn test_numbers_sort_numerically_and_ties_are_stable() {
    let sorted = sort_by_field(&rows(), Some("amount"), SortOrder::Asc);
    assert_eq!(ids(&sorted), vec![1, 4, 2, 3]);

    let sorted = sort_by_field(&rows(), Some("amount"), SortOrder::Desc);
    assert_eq!(ids(&sorted), vec![3, 2, 1, 4]);
  }

  #[test]
  fn test_text_ignores_case_with_lowercase_first() {
    let sorted = sort_by_field(&rows(), Some("title"), SortOrder::Asc);
    assert_eq!(ids(&sorted), vec![3, 2, 1, 4]);
  }

  #[test]
  fn test_accented_text_orders_by_code_point() {
    let a = FieldValue::Text("Élan".to_string());
    let z = FieldValue::Text("Zeta".to_string());
    assert_eq!(compare_values(&a, &z), Ordering::Greater);
  }

  #[test]
  fn test_dates_sort_by_instant() {
    let sorted = sort_by_field(&rows(), Some("deadline"), SortOrder::Desc);
    assert_eq!(ids(&sorted), vec![1, 3, 2, 4]);
  }

  #[test]
  fn test_no_field_keeps_input() {
    assert_eq!(sort_by_field(&rows(), None, SortOrder::Desc), rows());
  }

  #[test]
  fn test_custom_comparator() {
    let sorted = sort_with(&rows(), SortOrder::Desc, |a, b| a.id.cmp(&b.id));
    assert_eq!(ids(&sorted), vec![4, 3, 2, 1]);
  }
}
