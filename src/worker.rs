//! Explicit worker model: one OS thread, one current-thread runtime.
//!
//! Connections are not `Send`; each is confined to the worker that created it
//! and driven by tasks on the worker's local set. The registry, the metric
//! objects and the default resolver are all thread-local, so workers share
//! nothing and take no locks on the data path.

use std::future::Future;
use tokio::{runtime::Runtime, task::LocalSet};

/// One proxy worker: a named current-thread tokio runtime plus the local task
/// set that connection drivers are spawned onto.
pub struct Worker {
  name: String,
  runtime: Runtime,
  local: LocalSet,
}

impl Worker {
  /// Build a worker runtime for the calling thread.
  pub fn new(name: &str) -> std::io::Result<Self> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .thread_name(name)
      .build()?;
    Ok(Self {
      name: name.to_string(),
      runtime,
      local: LocalSet::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Run a future to completion on this worker, driving all local tasks.
  /// Connections must be created and used inside this call.
  pub fn block_on<F: Future>(&self, future: F) -> F::Output {
    self.local.block_on(&self.runtime, future)
  }

  /// Spawn a dedicated OS thread running its own worker.
  pub fn spawn<F, T>(name: &str, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
  where
    F: FnOnce(&Worker) -> T + Send + 'static,
    T: Send + 'static,
  {
    let worker_name = name.to_string();
    std::thread::Builder::new().name(name.to_string()).spawn(move || {
      let worker = Worker::new(&worker_name).expect("failed to build worker runtime");
      f(&worker)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn block_on_drives_local_tasks() {
    let worker = Worker::new("test-worker").unwrap();
    assert_eq!(worker.name(), "test-worker");
    let out = worker.block_on(async {
      let handle = tokio::task::spawn_local(async { 21 * 2 });
      handle.await.unwrap()
    });
    assert_eq!(out, 42);
  }

  #[test]
  fn spawned_worker_runs_on_its_own_thread() {
    let caller = std::thread::current().id();
    let handle = Worker::spawn("spawned-worker", move |worker| {
      assert_ne!(std::thread::current().id(), caller);
      worker.block_on(async { crate::registry::connection_count() })
    })
    .unwrap();
    // A fresh worker thread has its own, empty registry.
    assert_eq!(handle.join().unwrap(), 0);
  }
}
