//! Cached portal client.
//!
//! Wraps a [`PortalApi`] with the query cache: reads become [`QueryObserver`]s with
//! per-resource freshness, writes become [`Mutation`]s with optimistic updates and
//! settle-time invalidation. An `UNAUTHORIZED` error from any call ends the session.

use chrono::Utc;
use color_eyre::{Report, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::optimistic::{placeholder_id, prepend, remove_by_key, replace_by_key};
use crate::cache::{Mutation, MutationBuilder, QueryClient, QueryKey, QueryOptions};
use crate::query::QueryObserver;

use super::api::{is_unauthorized, PortalApi, PortalError};
use super::keys::{AuthKey, ScholarshipFilters, ScholarshipKey};
use super::types::{
  ArchivedScholarship, Credentials, NewScholarship, Registration, Scholarship, ScholarshipStats,
  ScholarshipStatus, ScholarshipUpdate, User,
};

const MINUTE: Duration = Duration::from_secs(60);

/// Drop every cached entry if `report` says the session is gone.
///
/// Only a session that was known to be signed in is ended, so a signed-out user polling a
/// protected resource does not clear the cache on every attempt.
fn end_session_if_unauthorized(client: &QueryClient, report: &Report) {
  if !is_unauthorized(report) {
    return;
  }
  let current = AuthKey::CurrentUser.cache_key();
  let signed_in = matches!(client.get_query_data::<Option<User>>(&current), Some(Some(_)));
  if signed_in {
    let removed = client.clear();
    client.set_query_data(&current, None::<User>);
    warn!(removed, "Session expired, cleared cached data");
  }
}

fn check_session<T>(client: &QueryClient, result: Result<T>) -> Result<T> {
  if let Err(report) = &result {
    end_session_if_unauthorized(client, report);
  }
  result
}

/// Portal client with transparent caching.
pub struct CachedPortal<A> {
  api: Arc<A>,
  client: QueryClient,
}

impl<A> Clone for CachedPortal<A> {
  fn clone(&self) -> Self {
    Self {
      api: Arc::clone(&self.api),
      client: self.client.clone(),
    }
  }
}

impl<A: PortalApi> CachedPortal<A> {
  pub fn new(api: Arc<A>, client: QueryClient) -> Self {
    Self { api, client }
  }

  pub fn api(&self) -> &Arc<A> {
    &self.api
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  // ============================================================================
  // Query options
  // ============================================================================

  /// Public listings: fresh for 2 minutes, refreshed every 5 while observed.
  pub fn list_options(&self) -> QueryOptions {
    self
      .client
      .default_options()
      .with_stale_time(2 * MINUTE)
      .with_gc_time(10 * MINUTE)
      .with_retries(2)
      .with_refetch_interval(5 * MINUTE)
  }

  /// The archive changes less often than the listings.
  pub fn archive_options(&self) -> QueryOptions {
    self
      .client
      .default_options()
      .with_stale_time(5 * MINUTE)
      .with_gc_time(15 * MINUTE)
      .with_retries(2)
  }

  pub fn user_options(&self) -> QueryOptions {
    self
      .client
      .default_options()
      .with_stale_time(5 * MINUTE)
      .with_gc_time(10 * MINUTE)
      .with_retries(0)
  }

  /// Wrap an API call as a query fetcher that ends the session on `UNAUTHORIZED`.
  fn fetcher<T, F, Fut>(
    &self,
    call: F,
  ) -> impl Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
  where
    T: Send + 'static,
    F: Fn(Arc<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let api = Arc::clone(&self.api);
    let client = self.client.clone();
    move || {
      let pending = call(Arc::clone(&api));
      let client = client.clone();
      async move { check_session(&client, pending.await) }.boxed()
    }
  }

  /// Start a mutation whose function calls the API and ends the session on `UNAUTHORIZED`.
  fn mutation<I, R, F, Fut>(&self, name: &str, call: F) -> MutationBuilder<I, R>
  where
    I: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(Arc<A>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let api = Arc::clone(&self.api);
    let client = self.client.clone();
    self.client.mutation(name, move |input: I| {
      let pending = call(Arc::clone(&api), input);
      let client = client.clone();
      async move { check_session(&client, pending.await) }
    })
  }

  // ============================================================================
  // Queries
  // ============================================================================

  /// Every scholarship, cached per filter set. Apply the filters with
  /// [`ScholarshipFilters::apply`] when rendering.
  pub fn scholarships(&self, filters: ScholarshipFilters) -> QueryObserver<Vec<Scholarship>> {
    self.client.query(
      ScholarshipKey::List(filters).cache_key(),
      self.fetcher(|api| async move { api.list_scholarships().await }),
      self.list_options(),
    )
  }

  /// One scholarship, looked up in the listing.
  pub fn scholarship(&self, id: &str) -> QueryObserver<Scholarship> {
    let wanted = id.to_string();
    let fetcher = self.fetcher(move |api| {
      let id = wanted.clone();
      async move {
        let found = api.list_scholarships().await?.into_iter().find(|s| s.id == id);
        found.ok_or_else(|| Report::new(PortalError::NotFound { id }))
      }
    });
    let options = self
      .client
      .default_options()
      .with_stale_time(2 * MINUTE)
      .with_retries(2);
    self
      .client
      .query(ScholarshipKey::Detail(id.to_string()).cache_key(), fetcher, options)
  }

  pub fn archived(&self) -> QueryObserver<Vec<ArchivedScholarship>> {
    self.client.query(
      ScholarshipKey::Archived.cache_key(),
      self.fetcher(|api| async move { api.list_archived().await }),
      self.archive_options(),
    )
  }

  pub fn statistics(&self) -> QueryObserver<ScholarshipStats> {
    self.client.query(
      ScholarshipKey::Statistics.cache_key(),
      self.fetcher(|api| async move {
        let list = api.list_scholarships().await?;
        Ok::<_, Report>(ScholarshipStats::from_list(&list))
      }),
      self.list_options(),
    )
  }

  /// The signed-in user. A failed check counts as signed out and is never retried.
  pub fn current_user(&self) -> QueryObserver<Option<User>> {
    self.client.query(
      AuthKey::CurrentUser.cache_key(),
      self.fetcher(|api| async move {
        let user = match api.current_user().await {
          Ok(user) => user,
          Err(error) => {
            debug!(error = %error, "Auth check failed, treating as signed out");
            None
          }
        };
        Ok::<_, Report>(user)
      }),
      self.user_options(),
    )
  }

  /// The cached signed-in user, without fetching.
  pub fn signed_in_user(&self) -> Option<User> {
    self
      .client
      .get_query_data::<Option<User>>(&AuthKey::CurrentUser.cache_key())
      .flatten()
  }

  pub async fn prefetch_scholarships(&self, filters: ScholarshipFilters) {
    let key = ScholarshipKey::List(filters).cache_key();
    let fetcher = self.fetcher(|api| async move { api.list_scholarships().await });
    self.client.prefetch(&key, fetcher, &self.list_options()).await;
  }

  pub async fn prefetch_current_user(&self) {
    let key = AuthKey::CurrentUser.cache_key();
    let fetcher =
      self.fetcher(|api| async move { Ok::<_, Report>(api.current_user().await.unwrap_or(None)) });
    self.client.prefetch(&key, fetcher, &self.user_options()).await;
  }

  // ============================================================================
  // Scholarship mutations
  // ============================================================================

  /// Create a scholarship. It shows up at the top of every cached list at once, under a
  /// placeholder id until the lists are refetched.
  pub fn create_scholarship(&self) -> Mutation<NewScholarship, Scholarship> {
    let lists = ScholarshipKey::Lists.cache_key();
    self
      .mutation("create scholarship", |api, new: NewScholarship| async move {
        api.create_scholarship(new).await
      })
      .affects(lists.clone())
      .optimistic(move |new, write| {
        let placeholder = Scholarship::placeholder(placeholder_id(), new, Utc::now());
        write.update_matching::<Vec<Scholarship>, _>(&lists, |list| {
          prepend(Some(list), placeholder.clone())
        });
      })
      .build()
  }

  pub fn update_scholarship(&self) -> Mutation<ScholarshipUpdate, Scholarship> {
    let lists = ScholarshipKey::Lists.cache_key();
    self
      .mutation("update scholarship", |api, update: ScholarshipUpdate| async move {
        api.update_scholarship(&update.id, update.patch).await
      })
      .affects(lists.clone())
      .affects(ScholarshipKey::Details.cache_key())
      .optimistic(move |update, write| {
        let now = Utc::now().to_rfc3339();
        let patch = |scholarship: Scholarship| {
          let mut patched = update.patch.apply(scholarship);
          patched.updated_at.clone_from(&now);
          patched
        };
        write.update_matching::<Vec<Scholarship>, _>(&lists, |list| {
          replace_by_key(list, &update.id, patch)
        });
        let detail = ScholarshipKey::Detail(update.id.clone()).cache_key();
        if let Some(current) = write.get::<Scholarship>(&detail) {
          write.set(&detail, patch(current));
        }
      })
      .build()
  }

  pub fn delete_scholarship(&self) -> Mutation<String, ()> {
    let lists = ScholarshipKey::Lists.cache_key();
    self
      .mutation("delete scholarship", |api, id: String| async move {
        api.delete_scholarship(&id).await
      })
      .affects(lists.clone())
      .affects(ScholarshipKey::Details.cache_key())
      .optimistic(move |id, write| {
        write.update_matching::<Vec<Scholarship>, _>(&lists, |list| remove_by_key(list, id));
      })
      .build()
  }

  /// Archive a scholarship. Lists show it as expired until the server confirms.
  pub fn archive_scholarship(&self) -> Mutation<String, ArchivedScholarship> {
    let lists = ScholarshipKey::Lists.cache_key();
    self
      .mutation("archive scholarship", |api, id: String| async move {
        api.archive_scholarship(&id).await
      })
      .affects(lists.clone())
      .affects(ScholarshipKey::Archived.cache_key())
      .optimistic(move |id, write| {
        let now = Utc::now().to_rfc3339();
        write.update_matching::<Vec<Scholarship>, _>(&lists, |list| {
          replace_by_key(list, id, |mut scholarship| {
            scholarship.status = ScholarshipStatus::Expired;
            scholarship.updated_at.clone_from(&now);
            scholarship
          })
        });
      })
      .build()
  }

  /// Expire everything past its deadline on the server, then refresh all scholarship data.
  pub fn update_expired(&self) -> Mutation<(), usize> {
    self
      .mutation("update expired scholarships", |api, _: ()| async move {
        api.update_expired().await
      })
      .affects(ScholarshipKey::All.cache_key())
      .build()
  }

  // ============================================================================
  // Session
  // ============================================================================

  pub fn login(&self) -> Mutation<Credentials, User> {
    let current = AuthKey::CurrentUser.cache_key();
    self
      .mutation("login", |api, credentials: Credentials| async move {
        api.login(credentials).await
      })
      .affects(current.clone())
      .on_success(move |user, write| write.set(&current, Some(user.clone())))
      .build()
  }

  pub fn register(&self) -> Mutation<Registration, User> {
    let current = AuthKey::CurrentUser.cache_key();
    self
      .mutation("register", |api, registration: Registration| async move {
        api.register(registration).await
      })
      .affects(current.clone())
      .on_success(move |user, write| write.set(&current, Some(user.clone())))
      .build()
  }

  /// End the session. Local data is dropped even if the server call fails.
  pub async fn logout(&self) {
    if let Err(error) = self.api.logout().await {
      warn!(error = %error, "Logout request failed, clearing local session anyway");
    }
    let auth = self.client.remove_queries(&AuthKey::All.cache_key());
    let rest = self.client.clear();
    info!(removed = auth + rest, "Logged out");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Cacheable, MutationStatus, QueryStatus};
  use crate::config::CacheConfig;
  use crate::portal::memory::{ops, InMemoryPortal};
  use crate::portal::types::{Role, ScholarshipPatch};

  fn new_scholarship(title: &str) -> NewScholarship {
    NewScholarship {
      title: title.to_string(),
      description: "For engineers".to_string(),
      location: "Accra".to_string(),
      benefits: "Stipend".to_string(),
      deadline: "2099-06-30T00:00:00Z".to_string(),
      kind: "Undergraduate".to_string(),
      requirements: "Transcript".to_string(),
    }
  }

  fn seeded(id: &str, title: &str) -> Scholarship {
    let mut scholarship = Scholarship::placeholder(id.to_string(), &new_scholarship(title), Utc::now());
    scholarship.provider_id = "org-1".to_string();
    scholarship
  }

  fn org() -> User {
    User {
      id: "org-1".to_string(),
      fullname: "Bright Futures".to_string(),
      email: "org@example.com".to_string(),
      role: Role::Organization,
      created_at: "2024-01-01T00:00:00Z".to_string(),
      updated_at: "2024-01-01T00:00:00Z".to_string(),
    }
  }

  fn credentials() -> Credentials {
    Credentials {
      email: "org@example.com".to_string(),
      password: "secret".to_string(),
    }
  }

  fn unavailable() -> PortalError {
    PortalError::Unavailable {
      message: "maintenance".to_string(),
    }
  }

  async fn setup() -> (Arc<InMemoryPortal>, CachedPortal<InMemoryPortal>) {
    let portal = Arc::new(InMemoryPortal::new().with_latency(Duration::from_millis(50)));
    portal.seed([seeded("sch-100", "Arts Grant")]);
    portal.add_account(org(), "secret");
    let cached = CachedPortal::new(Arc::clone(&portal), QueryClient::new(CacheConfig::default()));
    cached.login().mutate(credentials()).await.unwrap();
    (portal, cached)
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_shows_placeholder_then_server_id() {
    let (_portal, cached) = setup().await;
    let mut list = cached.scholarships(ScholarshipFilters::default());
    assert_eq!(list.settled().await.data.map(|l| l.len()), Some(1));

    let create = cached.create_scholarship();
    let pending = create.mutate(new_scholarship("STEM Award"));
    tokio::pin!(pending);
    assert!(futures::poll!(pending.as_mut()).is_pending());

    let optimistic = list.data().unwrap();
    assert_eq!(optimistic.len(), 2);
    assert!(optimistic[0].is_placeholder());
    assert_eq!(optimistic[0].title, "STEM Award");

    let created = pending.await.unwrap();
    assert_eq!(create.status(), MutationStatus::Success);
    assert!(list.state().is_stale);

    assert!(list.poll());
    let refreshed = list.settled().await.data.unwrap();
    assert_eq!(refreshed[0].id, created.id);
    assert!(refreshed.iter().all(|s| !s.is_placeholder()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_archive_rolls_back_every_list() {
    let (portal, cached) = setup().await;
    let mut all = cached.scholarships(ScholarshipFilters::default());
    let mut active = cached.scholarships(ScholarshipFilters {
      status: Some(ScholarshipStatus::Active),
      ..Default::default()
    });
    all.settled().await;
    active.settled().await;

    portal.fail_next(ops::ARCHIVE, 5, unavailable());
    let archive = cached.archive_scholarship();
    let pending = archive.mutate("sch-100".to_string());
    tokio::pin!(pending);
    assert!(futures::poll!(pending.as_mut()).is_pending());
    assert_eq!(all.data().unwrap()[0].status, ScholarshipStatus::Expired);
    assert_eq!(active.data().unwrap()[0].status, ScholarshipStatus::Expired);

    let err = pending.await.unwrap_err();
    assert!(err.to_string().contains("maintenance"));
    assert_eq!(all.data().unwrap()[0].status, ScholarshipStatus::Active);
    assert_eq!(active.data().unwrap()[0].status, ScholarshipStatus::Active);
    assert!(all.state().is_stale);
    assert!(active.state().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_patches_lists_and_detail() {
    let (_portal, cached) = setup().await;
    let mut list = cached.scholarships(ScholarshipFilters::default());
    let mut detail = cached.scholarship("sch-100");
    list.settled().await;
    assert_eq!(detail.settled().await.data.unwrap().title, "Arts Grant");

    let update = cached.update_scholarship();
    let pending = update.mutate(ScholarshipUpdate {
      id: "sch-100".to_string(),
      patch: ScholarshipPatch {
        title: Some("Arts & Design Grant".to_string()),
        ..Default::default()
      },
    });
    tokio::pin!(pending);
    assert!(futures::poll!(pending.as_mut()).is_pending());
    assert_eq!(list.data().unwrap()[0].title, "Arts & Design Grant");
    assert_eq!(detail.data().unwrap().title, "Arts & Design Grant");

    let saved = pending.await.unwrap();
    assert_eq!(saved.title, "Arts & Design Grant");
    assert!(detail.state().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_missing_detail_is_an_error() {
    let (_portal, cached) = setup().await;
    let mut detail = cached.scholarship("nope");
    let state = detail.settled().await;
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.unwrap().to_string().contains("not found"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_removes_optimistically() {
    let (portal, cached) = setup().await;
    let mut list = cached.scholarships(ScholarshipFilters::default());
    list.settled().await;

    cached.delete_scholarship().mutate("sch-100".to_string()).await.unwrap();
    assert_eq!(list.data(), Some(Vec::new()));
    assert!(portal.scholarships().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_login_caches_user_and_logout_clears_everything() {
    let (portal, cached) = setup().await;
    assert_eq!(cached.signed_in_user(), Some(org()));

    let mut list = cached.scholarships(ScholarshipFilters::default());
    list.settled().await;

    portal.fail_next(ops::LOGOUT, 1, unavailable());
    cached.logout().await;
    assert!(cached.client().store().is_empty());
    assert_eq!(cached.signed_in_user(), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unauthorized_ends_the_session() {
    let (portal, cached) = setup().await;
    let mut list = cached.scholarships(ScholarshipFilters::default());
    list.settled().await;

    portal.expire_session();
    let mut archive = cached.archived();
    archive.settled().await;

    assert_eq!(cached.signed_in_user(), None);
    assert_eq!(
      cached
        .client()
        .get_query_data::<Option<User>>(&AuthKey::CurrentUser.cache_key()),
      Some(None)
    );
    assert!(cached.client().get_query_data::<Vec<Scholarship>>(list.key()).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_current_user_query_and_stats() {
    let (_portal, cached) = setup().await;
    let mut user = cached.current_user();
    assert_eq!(user.settled().await.data, Some(Some(org())));

    let mut stats = cached.statistics();
    let stats = stats.settled().await.data.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_warms_list() {
    let (portal, cached) = setup().await;
    cached.prefetch_scholarships(ScholarshipFilters::default()).await;
    let list = cached.scholarships(ScholarshipFilters::default());
    assert_eq!(list.data().map(|l| l.len()), Some(1));
    assert!(!list.is_fetching());
    assert_eq!(portal.calls(ops::LIST_SCHOLARSHIPS), 1);
  }
}
