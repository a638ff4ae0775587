//! Per-worker list of live outbound connections.
//!
//! Every connection registers itself on creation and removes itself when the
//! last shared reference drops, so registry membership is exactly "not yet
//! destroyed". The list is thread-local: each worker owns its registry and
//! metric scrapes iterate it on the owning thread, never across threads.

use crate::connection::OutboundCore;
use std::{
  cell::{Cell, RefCell},
  rc::{Rc, Weak},
};

thread_local! {
  static REGISTRY: ConnectionRegistry = ConnectionRegistry::new();
}

/// Slot vector with a free list: insertion reuses holes, removal is O(1).
/// Iteration order is unimportant.
pub(crate) struct ConnectionRegistry {
  slots: RefCell<Vec<Option<Weak<OutboundCore>>>>,
  free: RefCell<Vec<usize>>,
  live: Cell<usize>,
}

impl ConnectionRegistry {
  fn new() -> Self {
    Self {
      slots: RefCell::new(Vec::new()),
      free: RefCell::new(Vec::new()),
      live: Cell::new(0),
    }
  }

  fn insert(&self, core: &Rc<OutboundCore>) -> usize {
    let weak = Rc::downgrade(core);
    self.live.set(self.live.get() + 1);
    if let Some(slot) = self.free.borrow_mut().pop() {
      self.slots.borrow_mut()[slot] = Some(weak);
      slot
    } else {
      let mut slots = self.slots.borrow_mut();
      slots.push(Some(weak));
      slots.len() - 1
    }
  }

  fn remove(&self, slot: usize) {
    let mut slots = self.slots.borrow_mut();
    if slots.get(slot).map(|s| s.is_some()).unwrap_or(false) {
      slots[slot] = None;
      drop(slots);
      self.free.borrow_mut().push(slot);
      self.live.set(self.live.get() - 1);
    }
  }

  fn iterate(&self, mut f: impl FnMut(&Rc<OutboundCore>)) {
    // Snapshot first so the callback may create or drop connections without
    // re-entering the slot vector.
    let cores: Vec<Rc<OutboundCore>> = self
      .slots
      .borrow()
      .iter()
      .flatten()
      .filter_map(Weak::upgrade)
      .collect();
    for core in cores.iter() {
      f(core);
    }
  }
}

/// Register a newly created connection; returns its slot for deregistration.
pub(crate) fn register(core: &Rc<OutboundCore>) -> usize {
  REGISTRY.with(|r| r.insert(core))
}

/// Remove a destroyed connection. Safe to call during thread teardown.
pub(crate) fn deregister(slot: usize) {
  let _ = REGISTRY.try_with(|r| r.remove(slot));
}

/// Visit every live connection on this worker.
pub(crate) fn for_each(f: impl FnMut(&Rc<OutboundCore>)) {
  REGISTRY.with(|r| r.iterate(f))
}

/// Number of live outbound connections on this worker thread.
pub fn connection_count() -> usize {
  REGISTRY.with(|r| r.live.get())
}
