//! # Reconcile
//!
//! Keeps locally cached collections in sync with an authoritative source.
//!
//! ## Core Concepts
//!
//! - **Tracked**: a cached entry pairing raw data with configuration derived from it
//! - **In-place reconciliation**: [`reconcile_in_place`] matches on raw data,
//!   then on derived configuration, so entries that survive keep their position
//! - **Scoped merge**: [`plan_merge`] decides which resources to drop, preserve,
//!   update or add when settings are read from user or system scope
//! - **Observers**: notifications mirror what a user interface holding indices
//!   into the collection needs to know
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{reconcile_in_place, EventLog, NoHooks};
//!
//! let mut cached = Vec::new();
//! let mut log = EventLog::new();
//! let summary = reconcile_in_place(
//!     &mut cached,
//!     fetch_targets()?,
//!     |target| derive_paths(target),
//!     &mut NoHooks,
//!     &mut log,
//! );
//! println!("{summary}");
//! ```
//!
//! ## Provider Traits
//!
//! - [`ReconcileObserver`]: receives add/update/remove notifications
//! - [`EntryHooks`]: sets up and tears down per-entry artifacts
//! - [`Identity`] / [`ScopedEntry`]: describe entries of a scoped collection

pub mod list;
pub mod observer;
pub mod scoped;
pub mod types;

// Re-export main types at crate root
pub use list::reconcile_in_place;
pub use observer::{EntryHooks, EventLog, NoHooks, NoObserver, ReconcileObserver};
pub use scoped::{Identity, MergePlan, ScopedEntry, plan_merge};
pub use types::{ReconcileEvent, ReconcileSummary, Scope, Tracked};
