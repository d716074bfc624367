//! Strictly sequential execution of queued sub-steps
//!
//! A [`BatchComposer`] is a FIFO drained by one worker task living on the
//! reactor. A step starts only after the previous one has finished, whether
//! the step is truly asynchronous or merely reports a result that is already
//! known (a check point).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Step = Pin<Box<dyn Future<Output = ()> + Send>>;

/// FIFO of asynchronous steps sharing one ordering guarantee
#[derive(Clone)]
pub struct BatchComposer {
    name: Arc<str>,
    queue: mpsc::UnboundedSender<Step>,
    pending: Arc<AtomicUsize>,
}

impl BatchComposer {
    /// Create a composer whose worker runs on `handle`
    pub fn new(handle: &Handle, name: &str) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Step>();
        let pending = Arc::new(AtomicUsize::new(0));
        let name: Arc<str> = Arc::from(name);

        let worker_pending = Arc::clone(&pending);
        let worker_name = Arc::clone(&name);
        handle.spawn(async move {
            while let Some(step) = rx.recv().await {
                step.await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            log::trace!("Batch {worker_name} closed");
        });

        Self {
            name,
            queue,
            pending,
        }
    }

    /// Name used in diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps queued or in flight
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Append a step; it starts as soon as every earlier step has finished
    pub fn enqueue<F>(&self, step: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(Box::pin(step)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::warn!("Batch {} is no longer running, step dropped", self.name);
        }
    }

    /// Append a step and receive its output once it has run
    pub fn submit<T, F>(&self, step: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(async move {
            // The receiver may have been dropped by a caller that lost interest
            let _ = tx.send(step.await);
        });
        rx
    }

    /// Append a trivial step that only invokes `callback`
    ///
    /// The callback is skipped when `context` has been dropped by the time
    /// the step runs. The queue advances either way.
    pub fn enqueue_check_point<C, F>(&self, context: &Arc<C>, callback: F)
    where
        C: Send + Sync + 'static,
        F: FnOnce(&C) + Send + 'static,
    {
        let context = Arc::downgrade(context);
        let name = Arc::clone(&self.name);
        self.enqueue(async move {
            match context.upgrade() {
                Some(context) => callback(&context),
                None => log::debug!("Batch {name}: context destroyed, skipping check point"),
            }
        });
    }
}

impl std::fmt::Debug for BatchComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchComposer")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
