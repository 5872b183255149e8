//! Eviction Scheduler: periodic removal of expired, unobserved entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::store::EntryStore;

/// Background sweeper bound to one store. Stops when dropped.
pub struct EvictionScheduler {
  sweeper: Arc<Sweeper>,
  task: JoinHandle<()>,
}

/// Single-flight sweep over a store.
struct Sweeper {
  store: Arc<EntryStore>,
  running: AtomicBool,
}

impl Sweeper {
  /// Returns `None` if another sweep is already running.
  fn sweep(&self) -> Option<usize> {
    if self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return None;
    }
    let evicted = self.store.evict_expired(Instant::now());
    self.running.store(false, Ordering::Release);

    if !evicted.is_empty() {
      debug!(evicted = evicted.len(), "Evicted expired cache entries");
    }
    Some(evicted.len())
  }
}

impl EvictionScheduler {
  /// Start sweeping `store` every `interval`. Requires a Tokio runtime.
  pub fn spawn(store: Arc<EntryStore>, interval: Duration) -> Self {
    let sweeper = Arc::new(Sweeper {
      store,
      running: AtomicBool::new(false),
    });

    let task = tokio::spawn({
      let sweeper = Arc::clone(&sweeper);
      async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
          ticker.tick().await;
          sweeper.sweep();
        }
      }
    });

    Self { sweeper, task }
  }

  /// Sweep now, outside the schedule. `None` if a sweep is already in progress.
  pub fn sweep_now(&self) -> Option<usize> {
    self.sweeper.sweep()
  }

  pub fn stop(self) {
    drop(self);
  }
}

impl Drop for EvictionScheduler {
  fn drop(&mut self) {
    self.task.abort();
  }
}
