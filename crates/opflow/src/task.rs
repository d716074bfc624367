//! Cooperative stop/continue/terminate for long-running commands
//!
//! A supervisor (usually a signal handler) talks to a running [`Task`] through
//! `stop`, `resume` and `terminate`. Each request is forwarded to the task's
//! [`Interruptible`] handler as a `begin_*` call carrying an [`Acknowledge`]
//! token, and the requester waits until that token is finished. Handlers that
//! do not override a request acknowledge it immediately, so suspension and
//! termination are advisory unless a concrete task opts in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
}

impl TaskState {
    /// Terminated is the only state a task never leaves
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Terminated)
    }
}

/// Kind of supervisor request being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Stop,
    Continue,
    Terminate,
}

/// Token a handler must finish exactly once per `begin_*` call
///
/// Dropping it unfinished counts as a failed acknowledgment.
#[derive(Debug)]
pub struct Acknowledge {
    request: Request,
    tx: Option<oneshot::Sender<bool>>,
}

impl Acknowledge {
    fn new(request: Request) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                tx: Some(tx),
            },
            rx,
        )
    }

    /// The request this token answers
    pub fn request(&self) -> Request {
        self.request
    }

    /// Deliver the matching `end_*` acknowledgment
    pub fn finish(mut self, ok: bool) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ok);
        }
    }
}

impl Drop for Acknowledge {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            log::warn!("{:?} request dropped without acknowledgment", self.request);
            let _ = tx.send(false);
        }
    }
}

/// Request handling implemented by a concrete task
pub trait Interruptible: Send + Sync {
    /// Suspension is opt-in; by default the task keeps running
    fn begin_stop(&self, ack: Acknowledge) {
        ack.finish(true);
    }

    fn begin_continue(&self, ack: Acknowledge) {
        ack.finish(true);
    }

    /// Default termination only tells the user to be patient
    fn begin_terminate(&self, ack: Acknowledge) {
        eprintln!("Wait please...");
        ack.finish(true);
    }
}

/// Handler relying entirely on the default request handling
pub struct Advisory;

impl Interruptible for Advisory {}

/// A long-running operation that a supervisor may interrupt
pub struct Task {
    name: String,
    state: Mutex<TaskState>,
    handler: Arc<dyn Interruptible>,
    exits: AtomicUsize,
    exit_tx: watch::Sender<bool>,
}

impl Task {
    /// Create an idle task
    pub fn new(name: impl Into<String>, handler: Arc<dyn Interruptible>) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            state: Mutex::new(TaskState::Idle),
            handler,
            exits: AtomicUsize::new(0),
            exit_tx,
        }
    }

    /// Create an idle task using the default request handling
    pub fn advisory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(Advisory))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move from `from` to `to` if the task is still in `from`
    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Mark the task as running
    pub fn started(&self) {
        if !self.transition(TaskState::Idle, TaskState::Running) {
            log::warn!("Task {} started twice (state {:?})", self.name, self.state());
        }
    }

    /// Ask the task to suspend; resolves once the task acknowledged
    pub async fn stop(&self) -> bool {
        if !self.transition(TaskState::Running, TaskState::Stopping) {
            log::debug!("Task {} cannot stop from {:?}", self.name, self.state());
            return false;
        }

        let (ack, rx) = Acknowledge::new(Request::Stop);
        self.handler.begin_stop(ack);
        let ok = rx.await.unwrap_or(false);

        let next = if ok {
            TaskState::Stopped
        } else {
            TaskState::Running
        };
        // A terminate request may have overtaken this one
        self.transition(TaskState::Stopping, next) && ok
    }

    /// Ask a stopped task to continue
    pub async fn resume(&self) -> bool {
        if self.state() != TaskState::Stopped {
            log::debug!("Task {} cannot continue from {:?}", self.name, self.state());
            return false;
        }

        let (ack, rx) = Acknowledge::new(Request::Continue);
        self.handler.begin_continue(ack);
        let ok = rx.await.unwrap_or(false);

        ok && self.transition(TaskState::Stopped, TaskState::Running)
    }

    /// Ask the task to terminate; advisory unless the handler overrides it
    pub async fn terminate(&self) -> bool {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() || *state == TaskState::Terminating {
                return false;
            }
            std::mem::replace(&mut *state, TaskState::Terminating)
        };

        let (ack, rx) = Acknowledge::new(Request::Terminate);
        self.handler.begin_terminate(ack);
        let ok = rx.await.unwrap_or(false);

        self.set_state(if ok {
            TaskState::Terminated
        } else {
            previous
        });
        ok
    }

    /// Deliver the exit notification; only the first call counts
    pub fn exited(&self) {
        if self.exits.fetch_add(1, Ordering::SeqCst) > 0 {
            log::debug!("Task {} already reported its exit", self.name);
            return;
        }
        self.exit_tx.send_replace(true);
    }

    /// Number of times `exited` was called
    pub fn exit_calls(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    /// Whether the exit notification has been delivered
    pub fn has_exited(&self) -> bool {
        *self.exit_tx.borrow()
    }

    /// Receiver flipping to `true` once the task exits
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }

    /// Start the task and get a guard delivering the exit notification on drop
    pub fn scope(&self) -> TaskScope<'_> {
        self.started();
        TaskScope { task: self }
    }

    /// Run `f` inside a scope so every return path reports one exit
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.scope();
        f()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`Task::scope`]
pub struct TaskScope<'a> {
    task: &'a Task,
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        self.task.exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    /// Handler that suspends for real and refuses to terminate
    struct Stubborn;

    impl Interruptible for Stubborn {
        fn begin_terminate(&self, ack: Acknowledge) {
            ack.finish(false);
        }
    }

    /// Handler that forgets to acknowledge stops
    struct Forgetful;

    impl Interruptible for Forgetful {
        fn begin_stop(&self, ack: Acknowledge) {
            drop(ack);
        }
    }

    fn block<T: Send + 'static>(
        reactor: &Reactor,
        f: impl std::future::Future<Output = T> + Send + 'static,
    ) -> T {
        reactor.wait(f).unwrap()
    }

    #[test]
    fn test_stop_continue_cycle() {
        let reactor = Reactor::new().unwrap();
        let task = Arc::new(Task::advisory("cycle"));
        task.started();

        let t = Arc::clone(&task);
        assert!(block(&reactor, async move { t.stop().await }));
        assert_eq!(task.state(), TaskState::Stopped);

        let t = Arc::clone(&task);
        assert!(block(&reactor, async move { t.resume().await }));
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_default_terminate_acknowledges() {
        let reactor = Reactor::new().unwrap();
        let task = Arc::new(Task::advisory("terminate"));
        task.started();

        let t = Arc::clone(&task);
        assert!(block(&reactor, async move { t.terminate().await }));
        assert_eq!(task.state(), TaskState::Terminated);

        let t = Arc::clone(&task);
        assert!(!block(&reactor, async move { t.terminate().await }));
    }

    #[test]
    fn test_refused_terminate_restores_state() {
        let reactor = Reactor::new().unwrap();
        let task = Arc::new(Task::new("stubborn", Arc::new(Stubborn)));
        task.started();

        let t = Arc::clone(&task);
        assert!(!block(&reactor, async move { t.terminate().await }));
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_dropped_acknowledgment_counts_as_failure() {
        let reactor = Reactor::new().unwrap();
        let task = Arc::new(Task::new("forgetful", Arc::new(Forgetful)));
        task.started();

        let t = Arc::clone(&task);
        assert!(!block(&reactor, async move { t.stop().await }));
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_stop_requires_running() {
        let reactor = Reactor::new().unwrap();
        let task = Arc::new(Task::advisory("idle"));

        let t = Arc::clone(&task);
        assert!(!block(&reactor, async move { t.stop().await }));
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn test_exit_notification_delivered_once() {
        let task = Task::advisory("exit");

        let result: Result<(), &str> = task.run(|| Err("validation failed"));
        assert!(result.is_err());
        task.exited();

        assert!(task.has_exited());
        assert_eq!(task.exit_calls(), 2);
        assert!(*task.subscribe_exit().borrow());
    }

    #[test]
    fn test_scope_reports_exit_on_early_return() {
        fn guarded(task: &Task, fail: bool) -> Option<u8> {
            let _scope = task.scope();
            if fail {
                return None;
            }
            Some(1)
        }

        let task = Task::advisory("early");
        assert_eq!(guarded(&task, true), None);
        assert!(task.has_exited());
        assert_eq!(task.state(), TaskState::Running);
    }
}
