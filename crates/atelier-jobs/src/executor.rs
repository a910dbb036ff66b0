//! Running job execution off the submitter's path.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// A unit of job execution.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Launches job execution without blocking the caller.
pub trait Spawner: Send + Sync {
    /// Start `task`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the task could not be launched. The task
    /// is dropped without running.
    fn spawn(&self, task: Task) -> std::io::Result<()>;
}

/// One named OS thread per task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, task: Task) -> std::io::Result<()> {
        std::thread::Builder::new()
            .name("atelier-analysis".to_owned())
            .spawn(task)
            .map(drop)
    }
}

/// Queues tasks until the owner drains them.
///
/// Makes job execution deterministic: nothing runs until
/// [`run_next`](Self::run_next) or [`run_all`](Self::run_all) is called
/// on the current thread.
#[derive(Default)]
pub struct ManualSpawner {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualSpawner {
    /// Spawner with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the oldest queued task. Returns `false` if the queue was empty.
    pub fn run_next(&self) -> bool {
        // Pop before running so a task may enqueue more work.
        let task = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(task) = task else {
            return false;
        };
        task();
        true
    }

    /// Run tasks until the queue is empty. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Drop every queued task without running it, simulating a worker
    /// that never picks anything up.
    pub fn discard_all(&self) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

impl std::fmt::Debug for ManualSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualSpawner")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, task: Task) -> std::io::Result<()> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        Ok(())
    }
}

impl<S: Spawner + ?Sized> Spawner for std::sync::Arc<S> {
    fn spawn(&self, task: Task) -> std::io::Result<()> {
        (**self).spawn(task)
    }
}
