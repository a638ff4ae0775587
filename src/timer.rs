//! Schedulable one-shot timer.
//!
//! Thin wrapper over the tokio timer wheel: a [`Timer`] can be armed with a
//! deadline, re-armed (which replaces the previous deadline), cancelled, and
//! awaited from inside a `select!` loop. Cancellation is idempotent.

use std::{future::pending, pin::Pin, time::Duration};
use tokio::time::{sleep_until, Instant, Sleep};

/// One-shot cancellable timer. Must be created within a tokio runtime.
pub struct Timer {
  sleep: Pin<Box<Sleep>>,
  armed: bool,
}

impl Timer {
  /// A timer with no deadline; [`Timer::expired`] never resolves until armed.
  pub fn unarmed() -> Self {
    Self {
      sleep: Box::pin(sleep_until(Instant::now())),
      armed: false,
    }
  }

  /// A timer already armed to fire after `delay`.
  pub fn after(delay: Duration) -> Self {
    let mut timer = Self::unarmed();
    timer.schedule(delay);
    timer
  }

  /// Arm the timer to fire after `delay`, replacing any previous deadline.
  pub fn schedule(&mut self, delay: Duration) {
    self.sleep.as_mut().reset(Instant::now() + delay);
    self.armed = true;
  }

  /// Disarm the timer. Idempotent.
  pub fn cancel(&mut self) {
    self.armed = false;
  }

  pub fn is_armed(&self) -> bool {
    self.armed
  }

  /// Resolves when the armed deadline passes; pends forever while unarmed.
  /// The timer disarms itself once it fires.
  pub async fn expired(&mut self) {
    if !self.armed {
      pending::<()>().await;
    }
    self.sleep.as_mut().await;
    self.armed = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::time::timeout;

  #[tokio::test]
  async fn fires_after_delay() {
    let mut timer = Timer::after(Duration::from_millis(20));
    let started = std::time::Instant::now();
    timer.expired().await;
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(!timer.is_armed());
  }

  #[tokio::test]
  async fn unarmed_never_fires() {
    let mut timer = Timer::unarmed();
    assert!(timeout(Duration::from_millis(50), timer.expired()).await.is_err());
  }

  #[tokio::test]
  async fn cancel_is_idempotent() {
    let mut timer = Timer::after(Duration::from_millis(10));
    timer.cancel();
    timer.cancel();
    assert!(!timer.is_armed());
    assert!(timeout(Duration::from_millis(50), timer.expired()).await.is_err());
  }

  #[tokio::test]
  async fn reschedule_replaces_deadline() {
    let mut timer = Timer::after(Duration::from_millis(500));
    timer.schedule(Duration::from_millis(10));
    let started = std::time::Instant::now();
    timer.expired().await;
    assert!(started.elapsed() < Duration::from_millis(400));
  }

  #[tokio::test]
  async fn rearms_after_firing() {
    let mut timer = Timer::after(Duration::from_millis(10));
    timer.expired().await;
    timer.schedule(Duration::from_millis(10));
    assert!(timer.is_armed());
    timer.expired().await;
    assert!(!timer.is_armed());
  }
}
