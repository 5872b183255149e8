//! Transport seam for the scholarship portal.

use async_trait::async_trait;
use color_eyre::{Report, Result};
use thiserror::Error;

use super::types::{
  ArchivedScholarship, Credentials, NewScholarship, Registration, Scholarship, ScholarshipPatch,
  User,
};

/// Failures the portal reports, as opposed to transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalError {
  #[error("UNAUTHORIZED: session expired or missing")]
  Unauthorized,
  #[error("scholarship `{id}` not found")]
  NotFound { id: String },
  #[error("invalid credentials")]
  InvalidCredentials,
  #[error("email `{email}` is already registered")]
  EmailTaken { email: String },
  #[error("portal unavailable: {message}")]
  Unavailable { message: String },
}

/// True if `report` means the session is no longer valid.
pub fn is_unauthorized(report: &Report) -> bool {
  report
    .chain()
    .any(|cause| matches!(cause.downcast_ref::<PortalError>(), Some(PortalError::Unauthorized)))
}

/// Operations offered by the portal backend.
///
/// Implementations do the network (or in-memory) work only; caching, retries and
/// optimistic updates live in [`super::CachedPortal`].
#[async_trait]
pub trait PortalApi: Send + Sync + 'static {
  async fn list_scholarships(&self) -> Result<Vec<Scholarship>>;

  async fn list_archived(&self) -> Result<Vec<ArchivedScholarship>>;

  /// The signed-in user, or `None` without a session.
  async fn current_user(&self) -> Result<Option<User>>;

  async fn create_scholarship(&self, new: NewScholarship) -> Result<Scholarship>;

  async fn update_scholarship(&self, id: &str, patch: ScholarshipPatch) -> Result<Scholarship>;

  async fn delete_scholarship(&self, id: &str) -> Result<()>;

  async fn archive_scholarship(&self, id: &str) -> Result<ArchivedScholarship>;

  /// Mark every scholarship past its deadline as expired. Returns how many changed.
  async fn update_expired(&self) -> Result<usize>;

  async fn login(&self, credentials: Credentials) -> Result<User>;

  async fn register(&self, registration: Registration) -> Result<User>;

  async fn logout(&self) -> Result<()>;
}
