//! In-process portal backend.
//!
//! Holds scholarships, the archive and user accounts in memory, with optional latency
//! and scripted failures. The CLI demo and the integration tests run against it.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::cache::lock::mutex_lock;

use super::api::{PortalApi, PortalError};
use super::types::{
  ArchivedScholarship, Credentials, NewScholarship, Registration, Scholarship, ScholarshipPatch,
  ScholarshipStatus, User,
};

const SOURCE: &str = "portal::memory";

/// Operation names accepted by [`InMemoryPortal::fail_next`] and [`InMemoryPortal::calls`].
pub mod ops {
  pub const LIST_SCHOLARSHIPS: &str = "list_scholarships";
  pub const LIST_ARCHIVED: &str = "list_archived";
  pub const CURRENT_USER: &str = "current_user";
  pub const CREATE: &str = "create_scholarship";
  pub const UPDATE: &str = "update_scholarship";
  pub const DELETE: &str = "delete_scholarship";
  pub const ARCHIVE: &str = "archive_scholarship";
  pub const UPDATE_EXPIRED: &str = "update_expired";
  pub const LOGIN: &str = "login";
  pub const REGISTER: &str = "register";
  pub const LOGOUT: &str = "logout";
}

struct Account {
  user: User,
  password: String,
}

#[derive(Default)]
struct PortalState {
  scholarships: Vec<Scholarship>,
  archived: Vec<ArchivedScholarship>,
  accounts: Vec<Account>,
  session: Option<String>,
  next_id: u64,
  calls: HashMap<String, u32>,
  failures: HashMap<String, (u32, PortalError)>,
}

impl PortalState {
  fn next_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}-{}", prefix, self.next_id)
  }

  fn session_user(&self) -> Option<&User> {
    let id = self.session.as_deref()?;
    self
      .accounts
      .iter()
      .map(|account| &account.user)
      .find(|user| user.id == id)
  }

  fn require_session(&self) -> Result<String, PortalError> {
    self
      .session_user()
      .map(|user| user.id.clone())
      .ok_or(PortalError::Unauthorized)
  }

  fn position(&self, id: &str) -> Result<usize, PortalError> {
    self
      .scholarships
      .iter()
      .position(|s| s.id == id)
      .ok_or_else(|| PortalError::NotFound { id: id.to_string() })
  }
}

/// A [`PortalApi`] backed by process memory.
#[derive(Default)]
pub struct InMemoryPortal {
  state: Mutex<PortalState>,
  latency: Option<Duration>,
}

impl InMemoryPortal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every call by `latency` before it touches any data.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  /// Add scholarships as if the server already held them.
  pub fn seed(&self, scholarships: impl IntoIterator<Item = Scholarship>) {
    mutex_lock(&self.state, SOURCE, "seed")
      .scholarships
      .extend(scholarships);
  }

  /// Add an account that can log in.
  pub fn add_account(&self, user: User, password: &str) {
    mutex_lock(&self.state, SOURCE, "add_account")
      .accounts
      .push(Account {
        user,
        password: password.to_string(),
      });
  }

  /// Make the next `times` calls of `op` fail with `error`.
  pub fn fail_next(&self, op: &str, times: u32, error: PortalError) {
    let mut state = mutex_lock(&self.state, SOURCE, "fail_next");
    if times == 0 {
      state.failures.remove(op);
    } else {
      state.failures.insert(op.to_string(), (times, error));
    }
  }

  /// Drop the server-side session, as an expired cookie would.
  pub fn expire_session(&self) {
    mutex_lock(&self.state, SOURCE, "expire_session").session = None;
  }

  /// Number of times `op` has been called.
  pub fn calls(&self, op: &str) -> u32 {
    mutex_lock(&self.state, SOURCE, "calls")
      .calls
      .get(op)
      .copied()
      .unwrap_or(0)
  }

  /// Current server-side scholarships.
  pub fn scholarships(&self) -> Vec<Scholarship> {
    mutex_lock(&self.state, SOURCE, "scholarships")
      .scholarships
      .clone()
  }

  /// Count the call, wait out the latency, then run `f` unless a failure is scripted.
  async fn call<T>(
    &self,
    op: &'static str,
    f: impl FnOnce(&mut PortalState) -> Result<T, PortalError>,
  ) -> Result<T> {
    *mutex_lock(&self.state, SOURCE, op)
      .calls
      .entry(op.to_string())
      .or_insert(0) += 1;

    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }

    let mut state = mutex_lock(&self.state, SOURCE, op);
    if let Some((remaining, error)) = state.failures.get_mut(op) {
      let error = error.clone();
      *remaining -= 1;
      if *remaining == 0 {
        state.failures.remove(op);
      }
      debug!(op, error = %error, "Injected portal failure");
      return Err(error.into());
    }
    Ok(f(&mut *state)?)
  }
}

#[async_trait]
impl PortalApi for InMemoryPortal {
  async fn list_scholarships(&self) -> Result<Vec<Scholarship>> {
    self
      .call(ops::LIST_SCHOLARSHIPS, |state| Ok(state.scholarships.clone()))
      .await
  }

  async fn list_archived(&self) -> Result<Vec<ArchivedScholarship>> {
    self
      .call(ops::LIST_ARCHIVED, |state| {
        state.require_session()?;
        Ok(state.archived.clone())
      })
      .await
  }

  async fn current_user(&self) -> Result<Option<User>> {
    self
      .call(ops::CURRENT_USER, |state| Ok(state.session_user().cloned()))
      .await
  }

  async fn create_scholarship(&self, new: NewScholarship) -> Result<Scholarship> {
    self
      .call(ops::CREATE, |state| {
        let provider_id = state.require_session()?;
        let now = Utc::now().to_rfc3339();
        let scholarship = Scholarship {
          id: state.next_id("sch"),
          title: new.title,
          description: new.description,
          location: new.location,
          benefits: new.benefits,
          deadline: new.deadline,
          kind: new.kind,
          requirements: new.requirements,
          status: ScholarshipStatus::Active,
          created_at: now.clone(),
          updated_at: now,
          provider_id,
          applicants: 0,
        };
        state.scholarships.insert(0, scholarship.clone());
        Ok(scholarship)
      })
      .await
  }

  async fn update_scholarship(&self, id: &str, patch: ScholarshipPatch) -> Result<Scholarship> {
    self
      .call(ops::UPDATE, |state| {
        state.require_session()?;
        let index = state.position(id)?;
        let mut updated = patch.apply(state.scholarships[index].clone());
        updated.updated_at = Utc::now().to_rfc3339();
        state.scholarships[index] = updated.clone();
        Ok(updated)
      })
      .await
  }

  async fn delete_scholarship(&self, id: &str) -> Result<()> {
    self
      .call(ops::DELETE, |state| {
        state.require_session()?;
        let index = state.position(id)?;
        state.scholarships.remove(index);
        Ok(())
      })
      .await
  }

  async fn archive_scholarship(&self, id: &str) -> Result<ArchivedScholarship> {
    self
      .call(ops::ARCHIVE, |state| {
        let archived_by = state.require_session()?;
        let index = state.position(id)?;
        let scholarship = state.scholarships.remove(index);
        let archived = ArchivedScholarship {
          id: state.next_id("arc"),
          scholarship_id: scholarship.id,
          title: scholarship.title,
          description: scholarship.description,
          location: scholarship.location,
          benefits: scholarship.benefits,
          deadline: scholarship.deadline,
          kind: scholarship.kind,
          requirements: scholarship.requirements,
          original_status: scholarship.status,
          archived_at: Utc::now().to_rfc3339(),
          archived_by,
          provider_id: scholarship.provider_id,
          original_created_at: scholarship.created_at,
          original_updated_at: scholarship.updated_at,
        };
        state.archived.insert(0, archived.clone());
        Ok(archived)
      })
      .await
  }

  async fn update_expired(&self) -> Result<usize> {
    self
      .call(ops::UPDATE_EXPIRED, |state| {
        state.require_session()?;
        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let mut changed = 0;
        for scholarship in &mut state.scholarships {
          let past = scholarship.deadline_at().is_some_and(|deadline| deadline < now);
          if past && scholarship.status == ScholarshipStatus::Active {
            scholarship.status = ScholarshipStatus::Expired;
            scholarship.updated_at.clone_from(&stamp);
            changed += 1;
          }
        }
        Ok(changed)
      })
      .await
  }

  async fn login(&self, credentials: Credentials) -> Result<User> {
    self
      .call(ops::LOGIN, |state| {
        let user = state
          .accounts
          .iter()
          .find(|a| a.user.email == credentials.email && a.password == credentials.password)
          .map(|a| a.user.clone())
          .ok_or(PortalError::InvalidCredentials)?;
        state.session = Some(user.id.clone());
        Ok(user)
      })
      .await
  }

  async fn register(&self, registration: Registration) -> Result<User> {
    self
      .call(ops::REGISTER, |state| {
        if state.accounts.iter().any(|a| a.user.email == registration.email) {
          return Err(PortalError::EmailTaken {
            email: registration.email,
          });
        }
        let now = Utc::now().to_rfc3339();
        let user = User {
          id: state.next_id("usr"),
          fullname: registration.fullname,
          email: registration.email,
          role: registration.role,
          created_at: now.clone(),
          updated_at: now,
        };
        state.accounts.push(Account {
          user: user.clone(),
          password: registration.password,
        });
        state.session = Some(user.id.clone());
        Ok(user)
      })
      .await
  }

  async fn logout(&self) -> Result<()> {
    self
      .call(ops::LOGOUT, |state| {
        state.session = None;
        Ok(())
      })
      .await
  }
}
