//! The process-wide reactor and the synchronous adapter built on top of it
//!
//! A [`Reactor`] owns one current-thread tokio runtime. Spawned tasks only make
//! progress while the reactor is being driven, which happens inside
//! [`Reactor::exec_async`]. That gives the CLI a flat, blocking control flow
//! while transports stay asynchronous underneath.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

/// One-shot completion handle passed to an asynchronous operation
///
/// Clones share a latch: the first [`Completion::complete`] delivers the value,
/// later calls are logged and dropped. Dropping every clone without completing
/// is a contract violation reported by [`Reactor::exec_async`].
pub struct Completion<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Completion<T> {
    fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completion, rx)
    }

    /// Report the result of the operation
    pub fn complete(&self, value: T) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                if tx.send(value).is_err() {
                    log::debug!("Completion delivered after the waiter went away");
                }
            }
            None => log::warn!("Ignoring repeated completion of an asynchronous operation"),
        }
    }

    /// Whether a result has already been reported
    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Single-threaded reactor shared by every asynchronous collaborator
pub struct Reactor {
    runtime: Runtime,
}

impl Reactor {
    /// Create the reactor
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime })
    }

    /// Handle for spawning work onto the reactor
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Start an operation and block until it reports completion
    ///
    /// `start` runs inside the reactor context, so it may `tokio::spawn`.
    /// While waiting, the reactor also services any other pending tasks.
    ///
    /// If the operation drops its completion without firing it, debug builds
    /// panic and release builds return [`Error::Abandoned`].
    pub fn exec_async<T, F>(&self, start: F) -> Result<T>
    where
        F: FnOnce(Completion<T>),
    {
        let (completion, rx) = Completion::new();
        {
            let _context = self.runtime.enter();
            start(completion);
        }

        match self.runtime.block_on(rx) {
            Ok(value) => Ok(value),
            Err(_) => {
                if cfg!(debug_assertions) {
                    panic!("asynchronous operation dropped its completion without firing it");
                }
                log::error!("Asynchronous operation finished without reporting a result");
                Err(Error::Abandoned)
            }
        }
    }

    /// Block until `future` resolves, servicing the reactor meanwhile
    pub fn wait<T, Fut>(&self, future: Fut) -> Result<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.exec_async(|done| {
            tokio::spawn(async move {
                done.complete(future.await);
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_exec_async_returns_value() {
        let reactor = Reactor::new().unwrap();
        let value = reactor
            .exec_async(|done| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.complete(42);
                });
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_exec_async_synchronous_completion() {
        let reactor = Reactor::new().unwrap();
        let value = reactor.exec_async(|done| done.complete("now")).unwrap();
        assert_eq!(value, "now");
    }

    #[test]
    fn test_repeated_completion_is_latched() {
        let reactor = Reactor::new().unwrap();
        let value = reactor
            .exec_async(|done| {
                let again = done.clone();
                done.complete(1);
                assert!(again.is_completed());
                again.complete(2);
            })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_wait_services_unrelated_tasks() {
        let reactor = Reactor::new().unwrap();
        let side = Arc::new(AtomicUsize::new(0));
        let side_clone = Arc::clone(&side);
        reactor.handle().spawn(async move {
            side_clone.fetch_add(1, Ordering::SeqCst);
        });

        let value = reactor
            .wait(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                7
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(side.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "dropped its completion"))]
    fn test_dropped_completion() {
        let reactor = Reactor::new().unwrap();
        let result: Result<bool> = reactor.exec_async(drop);
        assert!(matches!(result, Err(Error::Abandoned)));
    }
}
