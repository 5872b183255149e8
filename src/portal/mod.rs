//! Scholarship portal data on top of the query cache.
//!
//! [`PortalApi`] is the transport seam, [`CachedPortal`] adds caching, optimistic writes
//! and session handling, and [`InMemoryPortal`] is a self-contained backend.

mod api;
mod cached;
mod keys;
pub mod memory;
mod types;

pub use api::{is_unauthorized, PortalApi, PortalError};
pub use cached::CachedPortal;
pub use keys::{AuthKey, ScholarshipFilters, ScholarshipKey, ScholarshipSort, SEARCH_FIELDS};
pub use memory::InMemoryPortal;
pub use types::{
  parse_timestamp, ArchivedScholarship, Credentials, NewScholarship, Registration, Role,
  Scholarship, ScholarshipPatch, ScholarshipStats, ScholarshipStatus, ScholarshipUpdate, User,
};
