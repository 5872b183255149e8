use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tracing::info;

use querysync::cache::QueryClient;
use querysync::config::Config;
use querysync::logging;
use querysync::portal::memory::ops;
use querysync::portal::{
  CachedPortal, Credentials, InMemoryPortal, NewScholarship, PortalError, Role, Scholarship,
  ScholarshipFilters, ScholarshipPatch, ScholarshipSort, ScholarshipStatus, ScholarshipUpdate,
  User,
};
use querysync::views::{virtualize_window, BulkSelection};

#[derive(Parser, Debug)]
#[command(name = "querysync")]
#[command(about = "Keyed query cache with optimistic mutations, driven against an in-memory portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querysync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a scripted session: login, list, create, a failed archive, logout
  Demo {
    /// Simulated server latency in milliseconds
    #[arg(long, default_value_t = 150)]
    latency_ms: u64,
  },
  /// Print the effective configuration
  ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command.unwrap_or(Command::Demo { latency_ms: 150 }) {
    Command::ShowConfig => {
      println!("{:#?}", config);
      Ok(())
    }
    Command::Demo { latency_ms } => {
      let _guard = logging::init(&config.logging)?;
      run_demo(config, Duration::from_millis(latency_ms)).await
    }
  }
}

fn sample(id: &str, title: &str, location: &str, days_left: i64, applicants: u32) -> Scholarship {
  let now = Utc::now();
  let new = NewScholarship {
    title: title.to_string(),
    description: format!("{} for students in {}", title, location),
    location: location.to_string(),
    benefits: "Tuition and stipend".to_string(),
    deadline: (now + ChronoDuration::days(days_left)).to_rfc3339(),
    kind: "Undergraduate".to_string(),
    requirements: "Transcript and essay".to_string(),
  };
  let mut scholarship = Scholarship::placeholder(id.to_string(), &new, now);
  scholarship.provider_id = "org-1".to_string();
  scholarship.applicants = applicants;
  scholarship
}

fn print_list(label: &str, list: &[Scholarship]) {
  println!("{}:", label);
  for s in list {
    println!("  {:<24} {:<28} {:?} ({} applicants)", s.id, s.title, s.status, s.applicants);
  }
}

async fn run_demo(config: Config, latency: Duration) -> Result<()> {
  let portal = Arc::new(InMemoryPortal::new().with_latency(latency));
  portal.seed([
    sample("sch-101", "Arts Grant", "Nairobi", 30, 12),
    sample("sch-102", "STEM Excellence", "Accra", 10, 40),
    sample("sch-103", "Women in Engineering", "Kigali", -2, 7),
  ]);
  portal.add_account(
    User {
      id: "org-1".to_string(),
      fullname: "Bright Futures Foundation".to_string(),
      email: "org@example.com".to_string(),
      role: Role::Organization,
      created_at: Utc::now().to_rfc3339(),
      updated_at: Utc::now().to_rfc3339(),
    },
    "secret",
  );

  let client = QueryClient::start(config.cache.clone());
  let cached = CachedPortal::new(Arc::clone(&portal), client);

  let user = cached
    .login()
    .mutate(Credentials {
      email: "org@example.com".to_string(),
      password: "secret".to_string(),
    })
    .await?;
  println!("Signed in as {} ({:?})", user.fullname, user.role);

  let filters = ScholarshipFilters {
    sort_by: Some(ScholarshipSort::Applicants),
    ..Default::default()
  };
  let mut list = cached.scholarships(filters.clone());
  let loaded = list.settled().await.data.unwrap_or_default();
  let page = filters.apply(&loaded);
  print_list("Scholarships by applicants", &page.items);

  let window = virtualize_window(page.total_items, 48.0, 96.0, 0.0);
  println!("Rows to render: {}..{} of {}", window.start, window.end, page.total_items);

  let create = cached.create_scholarship();
  let pending = create.mutate(NewScholarship {
    title: "Data Science Fellowship".to_string(),
    description: "One year fellowship".to_string(),
    location: "Remote".to_string(),
    benefits: "Stipend".to_string(),
    deadline: (Utc::now() + ChronoDuration::days(60)).to_rfc3339(),
    kind: "Masters".to_string(),
    requirements: "Portfolio".to_string(),
  });
  tokio::pin!(pending);
  let created = match futures::poll!(pending.as_mut()) {
    Poll::Ready(result) => result?,
    Poll::Pending => {
      print_list("While the server is creating", &list.data().unwrap_or_default());
      pending.await?
    }
  };
  list.poll();
  print_list("After refetch", &list.settled().await.data.unwrap_or_default());

  cached
    .update_scholarship()
    .mutate(ScholarshipUpdate {
      id: created.id.clone(),
      patch: ScholarshipPatch {
        title: Some("Data Science Fellowship 2025".to_string()),
        ..Default::default()
      },
    })
    .await?;

  portal.fail_next(
    ops::ARCHIVE,
    config.cache.mutation_retries + 1,
    PortalError::Unavailable {
      message: "archive service down".to_string(),
    },
  );
  if let Err(error) = cached.archive_scholarship().mutate("sch-101".to_string()).await {
    println!("Archive failed ({}), list rolled back:", error);
    let statuses: Vec<_> = list
      .data()
      .unwrap_or_default()
      .into_iter()
      .map(|s| (s.id, s.status))
      .collect();
    println!("  {:?}", statuses);
  }

  let expired = cached.update_expired().mutate(()).await?;
  println!("Expired {} scholarship(s) past their deadline", expired);
  list.poll();
  let refreshed = list.settled().await.data.unwrap_or_default();

  let mut selection = BulkSelection::new();
  selection.select_all(&refreshed);
  let still_open: Vec<_> = selection
    .selected_items(&refreshed)
    .into_iter()
    .filter(|s| s.status == ScholarshipStatus::Active)
    .collect();
  print_list("Still open", &still_open);

  let mut stats = cached.statistics();
  if let Some(stats) = stats.settled().await.data {
    println!(
      "Totals: {} listed, {} active, {} expired, {} applicants",
      stats.total, stats.active, stats.expired, stats.applicants
    );
  }

  cached.logout().await;
  info!(entries = cached.client().store().len(), "Demo finished");
  println!("Signed out, {} cached entries left", cached.client().store().len());
  Ok(())
}
