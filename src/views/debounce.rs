//! Debouncing for search boxes and other bursty input.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "views::debounce";

/// A value that only takes on a new input after `delay` without further input.
///
/// Intermediate inputs are dropped, never queued. Drive it from the event loop with
/// [`Debounced::poll`], or await [`Debounced::settled`].
#[derive(Debug, Clone)]
pub struct Debounced<T> {
  delay: Duration,
  current: T,
  pending: Option<(T, Instant)>,
}

impl<T> Debounced<T> {
  pub fn new(initial: T, delay: Duration) -> Self {
    Self {
      delay,
      current: initial,
      pending: None,
    }
  }

  /// Record a new input and restart the quiet period.
  pub fn set(&mut self, value: T) {
    self.pending = Some((value, Instant::now() + self.delay));
  }

  /// Apply the pending input if its quiet period has elapsed. Returns `true` if the
  /// value changed.
  pub fn poll(&mut self) -> bool {
    match self.pending.take() {
      Some((value, deadline)) if Instant::now() >= deadline => {
        self.current = value;
        true
      }
      still_waiting => {
        self.pending = still_waiting;
        false
      }
    }
  }

  pub fn get(&self) -> &T {
    &self.current
  }

  pub fn is_pending(&self) -> bool {
    self.pending.is_some()
  }

  /// Wait out the quiet period of the pending input, if any, and return the value.
  pub async fn settled(&mut self) -> &T {
    if let Some((_, deadline)) = &self.pending {
      tokio::time::sleep_until(*deadline).await;
    }
    self.poll();
    &self.current
  }
}

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// A callback that runs only for the last call in a burst.
///
/// Each call cancels the previous pending invocation and schedules a new one `delay`
/// later. Dropping the handle cancels whatever is pending. Requires a Tokio runtime.
pub struct DebouncedCallback<A> {
  callback: Callback<A>,
  delay: Duration,
  pending: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Send + 'static> DebouncedCallback<A> {
  pub fn new<F>(delay: Duration, callback: F) -> Self
  where
    F: Fn(A) + Send + Sync + 'static,
  {
    Self {
      callback: Arc::new(callback),
      delay,
      pending: Mutex::new(None),
    }
  }

  pub fn call(&self, args: A) {
    let mut pending = mutex_lock(&self.pending, SOURCE, "call");
    if let Some(previous) = pending.take() {
      previous.abort();
    }
    let callback = Arc::clone(&self.callback);
    let delay = self.delay;
    *pending = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      callback(args);
    }));
  }

  pub fn cancel(&self) {
    if let Some(previous) = mutex_lock(&self.pending, SOURCE, "cancel").take() {
      previous.abort();
    }
  }

  pub fn is_pending(&self) -> bool {
    mutex_lock(&self.pending, SOURCE, "is_pending")
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }
}

impl<A> Drop for DebouncedCallback<A> {
  fn drop(&mut self) {
    if let Some(previous) = mutex_lock(&self.pending, SOURCE, "drop").take() {
      previous.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_only_the_last_value_lands() {
    let mut search = Debounced::new(String::new(), Duration::from_millis(300));
    search.set("s".to_string());
    tokio::time::advance(Duration::from_millis(100)).await;
    search.set("sc".to_string());
    tokio::time::advance(Duration::from_millis(250)).await;
    assert!(!search.poll());
    assert_eq!(search.get(), "");

    tokio::time::advance(Duration::from_millis(60)).await;
    assert!(search.poll());
    assert_eq!(search.get(), "sc");
    assert!(!search.is_pending());
  }

  #[tokio::test(start_paused = true)]
  async fn test_settled_waits_for_quiet_period() {
    let mut search = Debounced::new(0u32, Duration::from_millis(300));
    search.set(1);
    search.set(2);
    let started = Instant::now();
    assert_eq!(*search.settled().await, 2);
    assert_eq!(started.elapsed(), Duration::from_millis(300));
  }

  #[tokio::test(start_paused = true)]
  async fn test_callback_runs_once_for_a_burst() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let debounced = DebouncedCallback::new(Duration::from_millis(200), move |term: &'static str| {
      let _ = tx.send(term);
    });

    debounced.call("a");
    tokio::time::sleep(Duration::from_millis(50)).await;
    debounced.call("ab");
    tokio::time::sleep(Duration::from_millis(50)).await;
    debounced.call("abc");
    assert!(debounced.is_pending());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(rx.try_recv().ok(), Some("abc"));
    assert!(rx.try_recv().is_err());
    assert!(!debounced.is_pending());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_and_drop_discard_pending_call() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let debounced = DebouncedCallback::new(Duration::from_millis(200), move |n: u32| {
      let _ = tx.send(n);
    });

    debounced.call(1);
    debounced.cancel();
    debounced.call(2);
    drop(debounced);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());
  }
}
