//! Scholarship portal entities.
//!
//! Timestamps are kept as the ISO 8601 strings the portal sends, and parsed on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;
use crate::views::{FieldValue, Fields};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScholarshipStatus {
  Active,
  Expired,
}

/// A scholarship as listed by the portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scholarship {
  pub id: String,
  pub title: String,
  pub description: String,
  pub location: String,
  pub benefits: String,
  pub deadline: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub requirements: String,
  pub status: ScholarshipStatus,
  pub created_at: String,
  pub updated_at: String,
  pub provider_id: String,
  #[serde(default)]
  pub applicants: u32,
}

impl Scholarship {
  /// Optimistic stand-in for a scholarship the server has not created yet.
  pub fn placeholder(id: String, new: &NewScholarship, now: DateTime<Utc>) -> Self {
    let now = now.to_rfc3339();
    Self {
      id,
      title: new.title.clone(),
      description: new.description.clone(),
      location: new.location.clone(),
      benefits: new.benefits.clone(),
      deadline: new.deadline.clone(),
      kind: new.kind.clone(),
      requirements: new.requirements.clone(),
      status: ScholarshipStatus::Active,
      created_at: now.clone(),
      updated_at: now,
      provider_id: "temp".to_string(),
      applicants: 0,
    }
  }

  pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
    parse_timestamp(&self.deadline)
  }
}

/// Input for creating a scholarship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScholarship {
  pub title: String,
  pub description: String,
  pub location: String,
  pub benefits: String,
  pub deadline: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub requirements: String,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScholarshipPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub benefits: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deadline: Option<String>,
  #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub requirements: Option<String>,
}

impl ScholarshipPatch {
  pub fn apply(&self, mut scholarship: Scholarship) -> Scholarship {
    let fields = [
      (&self.title, &mut scholarship.title),
      (&self.description, &mut scholarship.description),
      (&self.location, &mut scholarship.location),
      (&self.benefits, &mut scholarship.benefits),
      (&self.deadline, &mut scholarship.deadline),
      (&self.kind, &mut scholarship.kind),
      (&self.requirements, &mut scholarship.requirements),
    ];
    for (patch, field) in fields {
      if let Some(value) = patch {
        field.clone_from(value);
      }
    }
    scholarship
  }
}

/// Input for the update mutation
#[derive(Debug, Clone, PartialEq)]
pub struct ScholarshipUpdate {
  pub id: String,
  pub patch: ScholarshipPatch,
}

/// Counts shown on the organization dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScholarshipStats {
  pub total: usize,
  pub active: usize,
  pub expired: usize,
  pub applicants: u64,
}

impl ScholarshipStats {
  pub fn from_list(list: &[Scholarship]) -> Self {
    list.iter().fold(Self::default(), |mut stats, scholarship| {
      stats.total += 1;
      match scholarship.status {
        ScholarshipStatus::Active => stats.active += 1,
        ScholarshipStatus::Expired => stats.expired += 1,
      }
      stats.applicants += u64::from(scholarship.applicants);
      stats
    })
  }
}

/// A scholarship moved to the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedScholarship {
  pub id: String,
  pub scholarship_id: String,
  pub title: String,
  pub description: String,
  pub location: String,
  pub benefits: String,
  pub deadline: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub requirements: String,
  pub original_status: ScholarshipStatus,
  pub archived_at: String,
  pub archived_by: String,
  pub provider_id: String,
  pub original_created_at: String,
  pub original_updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
  Student,
  Organization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub fullname: String,
  pub email: String,
  pub role: Role,
  pub created_at: String,
  pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
  pub fullname: String,
  pub email: String,
  pub password: String,
  pub role: Role,
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value)
    .ok()
    .map(|date| date.with_timezone(&Utc))
}

fn date_or_text(value: &str) -> FieldValue {
  match parse_timestamp(value) {
    Some(date) => FieldValue::Date(date),
    None => FieldValue::Text(value.to_string()),
  }
}

fn status_text(status: ScholarshipStatus) -> FieldValue {
  FieldValue::Text(
    match status {
      ScholarshipStatus::Active => "ACTIVE",
      ScholarshipStatus::Expired => "EXPIRED",
    }
    .to_string(),
  )
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Scholarship {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    Some(&self.updated_at)
  }
}

impl Cacheable for ArchivedScholarship {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    Some(&self.archived_at)
  }
}

impl Cacheable for User {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<&str> {
    Some(&self.updated_at)
  }
}

// ============================================================================
// Field access for sort and search views
// ============================================================================

impl Fields for Scholarship {
  fn field(&self, name: &str) -> Option<FieldValue> {
    let text = |value: &str| Some(FieldValue::Text(value.to_string()));
    match name {
      "id" => text(&self.id),
      "title" => text(&self.title),
      "description" => text(&self.description),
      "location" => text(&self.location),
      "benefits" => text(&self.benefits),
      "type" => text(&self.kind),
      "requirements" => text(&self.requirements),
      "status" => Some(status_text(self.status)),
      "deadline" => Some(date_or_text(&self.deadline)),
      "createdAt" => Some(date_or_text(&self.created_at)),
      "updatedAt" => Some(date_or_text(&self.updated_at)),
      "applicants" => Some(FieldValue::Number(f64::from(self.applicants))),
      _ => None,
    }
  }
}

impl Fields for ArchivedScholarship {
  fn field(&self, name: &str) -> Option<FieldValue> {
    let text = |value: &str| Some(FieldValue::Text(value.to_string()));
    match name {
      "title" => text(&self.title),
      "description" => text(&self.description),
      "location" => text(&self.location),
      "type" => text(&self.kind),
      "originalStatus" => Some(status_text(self.original_status)),
      "deadline" => Some(date_or_text(&self.deadline)),
      "archivedAt" => Some(date_or_text(&self.archived_at)),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::optimistic::placeholder_id;
  use chrono::TimeZone;

  fn new_scholarship() -> NewScholarship {
    NewScholarship {
      title: "STEM Excellence".to_string(),
      description: "For engineering students".to_string(),
      location: "Nairobi".to_string(),
      benefits: "Full tuition".to_string(),
      deadline: "2025-06-30T00:00:00Z".to_string(),
      kind: "Undergraduate".to_string(),
      requirements: "GPA 3.5".to_string(),
    }
  }

  #[test]
  fn test_wire_format_matches_portal() {
    let json = r#"{
      "id": "s1", "title": "T", "description": "D", "location": "L", "benefits": "B",
      "deadline": "2025-01-01T00:00:00Z", "type": "Masters", "requirements": "R",
      "status": "EXPIRED", "createdAt": "2024-01-01T00:00:00Z",
      "updatedAt": "2024-02-01T00:00:00Z", "providerId": "p1"
    }"#;
    let scholarship: Scholarship = serde_json::from_str(json).unwrap();
    assert_eq!(scholarship.kind, "Masters");
    assert_eq!(scholarship.status, ScholarshipStatus::Expired);
    assert_eq!(scholarship.applicants, 0);
    assert_eq!(
      scholarship.deadline_at(),
      Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    );
  }

  #[test]
  fn test_placeholder_is_active_and_marked() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    let placeholder = Scholarship::placeholder(placeholder_id(), &new_scholarship(), now);
    assert!(placeholder.is_placeholder());
    assert_eq!(placeholder.status, ScholarshipStatus::Active);
    assert_eq!(placeholder.provider_id, "temp");
    assert_eq!(placeholder.created_at, now.to_rfc3339());
  }

  #[test]
  fn test_patch_only_touches_given_fields() {
    let original = Scholarship::placeholder("s1".to_string(), &new_scholarship(), Utc::now());
    let patch = ScholarshipPatch {
      title: Some("Renamed".to_string()),
      ..Default::default()
    };
    let patched = patch.apply(original.clone());
    assert_eq!(patched.title, "Renamed");
    assert_eq!(patched.location, original.location);
    assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"title":"Renamed"}"#);
  }

  #[test]
  fn test_stats_count_statuses_and_applicants() {
    let mut active = Scholarship::placeholder("s1".to_string(), &new_scholarship(), Utc::now());
    active.applicants = 3;
    let mut expired = active.clone();
    expired.id = "s2".to_string();
    expired.status = ScholarshipStatus::Expired;
    let stats = ScholarshipStats::from_list(&[active, expired]);
    assert_eq!(
      stats,
      ScholarshipStats {
        total: 2,
        active: 1,
        expired: 1,
        applicants: 6,
      }
    );
    assert_eq!(ScholarshipStats::from_list(&[]), ScholarshipStats::default());
  }

  #[test]
  fn test_fields_expose_dates_and_numbers() {
    let scholarship = Scholarship::placeholder("s1".to_string(), &new_scholarship(), Utc::now());
    assert!(matches!(scholarship.field("deadline"), Some(FieldValue::Date(_))));
    assert_eq!(scholarship.field("applicants"), Some(FieldValue::Number(0.0)));
    assert_eq!(
      scholarship.field("status"),
      Some(FieldValue::Text("ACTIVE".to_string()))
    );
    assert_eq!(scholarship.field("nope"), None);
  }
}
