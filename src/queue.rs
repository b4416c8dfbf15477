//! Task Queue - FIFO, group-barriered execution of background work
//!
//! Work is admitted as groups of futures. `execute` drains groups in admission
//! order; the tasks of one group run concurrently and all of them finish
//! before the next group starts. Only one `execute` pass may run at a time.
//!
//! Tasks return `()`: each task is responsible for handling and reporting its
//! own failure so that the group barrier always completes.

use crate::error::{Error, Result};
use futures::future::{join_all, BoxFuture};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A unit of queued work.
pub type Task = BoxFuture<'static, ()>;

/// Tasks that run concurrently and are awaited together.
pub type TaskGroup = Vec<Task>;

#[derive(Default)]
pub struct TaskQueue {
    pending: Mutex<VecDeque<TaskGroup>>,
    running: AtomicBool,
}

/// Clears the running flag when an execute pass ends, including by unwinding.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn groups(&self) -> MutexGuard<'_, VecDeque<TaskGroup>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a group of tasks. Empty groups are ignored.
    pub fn add(&self, group: TaskGroup) {
        if group.is_empty() {
            return;
        }
        let mut groups = self.groups();
        groups.push_back(group);
        debug!("Queued task group ({} pending)", groups.len());
    }

    /// Append a single task as its own group.
    pub fn add_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.add(vec![Box::pin(task)]);
    }

    /// Number of groups waiting to run.
    pub fn pending(&self) -> usize {
        self.groups().len()
    }

    pub fn has_pending(&self) -> bool {
        !self.groups().is_empty()
    }

    /// Whether an `execute` pass is currently active.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run up to `limit` groups (all pending groups when `None`) and return
    /// how many ran.
    ///
    /// Fails with [`Error::StillInProgress`] without touching the pending
    /// groups when another pass is active.
    pub async fn execute(&self, limit: Option<usize>) -> Result<usize> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::StillInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let mut executed = 0;
        while limit.map_or(true, |limit| executed < limit) {
            let Some(group) = self.groups().pop_front() else {
                break;
            };

            debug!("Executing task group with {} task(s)", group.len());
            join_all(group).await;
            executed += 1;
        }

        if executed > 0 {
            debug!(
                "Queue pass finished: {} group(s) executed, {} pending",
                executed,
                self.pending()
            );
        }
        Ok(executed)
    }
}
