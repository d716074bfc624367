//! # Opflow
//!
//! Building blocks for a CLI that drives asynchronous transports from a flat,
//! single-threaded control flow.
//!
//! ## Core Concepts
//!
//! - **Reactor**: one current-thread runtime per process
//! - **Synchronous adapter**: [`Reactor::exec_async`] starts a callback-completed
//!   operation and blocks until its [`Completion`] fires
//! - **Batch composer**: a FIFO guaranteeing non-overlapping execution of
//!   queued steps, with check points that respect a weakly held context
//! - **Task**: cooperative stop/continue/terminate with acknowledgments
//!
//! ## Example
//!
//! ```ignore
//! use opflow::{BatchComposer, Reactor};
//!
//! let reactor = Reactor::new()?;
//! let batch = BatchComposer::new(&reactor.handle(), "vm");
//!
//! let ok = reactor.exec_async(|done| {
//!     batch.enqueue(async move {
//!         // talk to the transport
//!         done.complete(true);
//!     });
//! })?;
//! ```

pub mod batch;
pub mod error;
pub mod reactor;
pub mod supervisor;
pub mod task;

// Re-export main types at crate root
pub use batch::BatchComposer;
pub use error::{Error, Result};
pub use reactor::{Completion, Reactor};
pub use supervisor::{Supervisor, supervise};
pub use task::{Acknowledge, Advisory, Interruptible, Request, Task, TaskScope, TaskState};
