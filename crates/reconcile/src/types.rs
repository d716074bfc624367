//! Core types for reconciliation

use serde::{Deserialize, Serialize};

/// A cached entry: raw authoritative data plus configuration derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked<T, D> {
    pub raw: T,
    pub derived: D,
}

impl<T, D> Tracked<T, D> {
    /// Pair raw data with its derived configuration
    pub fn new(raw: T, derive: impl Fn(&T) -> D) -> Self {
        let derived = derive(&raw);
        Self { raw, derived }
    }
}

/// A single notification emitted during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileEvent {
    Added { index: usize },
    Updated { index: usize },
    Removed { index: usize },
}

/// Scope a collection-level merge reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Settings owned by the user
    User,
    /// Settings provided by the installation
    System,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    /// Total number of notifications emitted
    pub fn total_changes(&self) -> usize {
        self.added + self.updated + self.removed
    }

    /// Check if the pass left the collection untouched
    pub fn is_noop(&self) -> bool {
        self.total_changes() == 0
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ReconcileSummary) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
    }

    /// Count an event
    pub fn add_event(&mut self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::Added { .. } => self.added += 1,
            ReconcileEvent::Updated { .. } => self.updated += 1,
            ReconcileEvent::Removed { .. } => self.removed += 1,
        }
    }
}

impl std::fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed, {} unchanged",
            self.added, self.updated, self.removed, self.unchanged
        )
    }
}
