//! Signal-driven supervision of the current task

use crate::task::Task;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Interrupt listener of one task, stopped when dropped
#[derive(Debug)]
pub struct Supervisor {
    listener: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Wait until the listener stops on its own
    pub async fn join(mut self) -> bool {
        match self.listener.take() {
            Some(listener) => listener.await.is_ok(),
            None => true,
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Forward interrupt signals to `task` as terminate requests until it exits
///
/// Termination is advisory: the task decides what a request means, and the
/// process is not killed by the interrupt while supervision is active.
pub fn supervise(handle: &Handle, task: Arc<Task>) -> Supervisor {
    let mut exited = task.subscribe_exit();
    let listener = handle.spawn(async move {
        while !*exited.borrow() {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        log::warn!("Cannot listen for interrupts: {e}");
                        break;
                    }
                    log::debug!("Interrupt received, terminating {}", task.name());
                    if !task.terminate().await {
                        log::debug!("Task {} did not accept the terminate request", task.name());
                    }
                }
                changed = exited.changed() => {
                    if changed.is_err() || *exited.borrow() {
                        break;
                    }
                }
            }
        }
    });
    Supervisor {
        listener: Some(listener),
    }
}
