//! Observer and lifecycle hook traits
//!
//! These traits let the reconciliation algorithms report what they did and
//! manage per-entry side effects (on-disk artifacts, caches) without knowing
//! anything about the entries themselves.

use crate::types::{ReconcileEvent, Tracked};

/// Receives notifications while a cached collection is mutated
///
/// Indices are positions in the cached collection at the moment of the
/// notification.
pub trait ReconcileObserver {
    /// Called after an entry has been appended
    fn on_added(&mut self, index: usize);

    /// Called after an entry has been updated in place
    fn on_updated(&mut self, index: usize);

    /// Called before an entry is erased
    fn on_about_to_remove(&mut self, index: usize);
}

/// Manages side effects tied to the lifetime of a cached entry
pub trait EntryHooks<T, D> {
    /// Set up artifacts for a freshly added or updated entry
    fn init(&mut self, index: usize, entry: &Tracked<T, D>);

    /// Tear down artifacts of an entry about to be removed or replaced
    fn deinit(&mut self, index: usize, entry: &Tracked<T, D>);
}

/// No-op observer
pub struct NoObserver;

impl ReconcileObserver for NoObserver {
    fn on_added(&mut self, _index: usize) {}
    fn on_updated(&mut self, _index: usize) {}
    fn on_about_to_remove(&mut self, _index: usize) {}
}

/// No-op hooks
pub struct NoHooks;

impl<T, D> EntryHooks<T, D> for NoHooks {
    fn init(&mut self, _index: usize, _entry: &Tracked<T, D>) {}
    fn deinit(&mut self, _index: usize, _entry: &Tracked<T, D>) {}
}

/// Observer recording every notification in order
#[derive(Debug, Default)]
pub struct EventLog {
    pub events: Vec<ReconcileEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing was reported
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl ReconcileObserver for EventLog {
    fn on_added(&mut self, index: usize) {
        self.events.push(ReconcileEvent::Added { index });
    }

    fn on_updated(&mut self, index: usize) {
        self.events.push(ReconcileEvent::Updated { index });
    }

    fn on_about_to_remove(&mut self, index: usize) {
        self.events.push(ReconcileEvent::Removed { index });
    }
}
