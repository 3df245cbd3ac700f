//! Worker pool for parallel job execution.
//!
//! This module provides a pool of named OS threads that drain the shared
//! [`JobQueue`], run each job's dispatch wrapper, and exit once the queue
//! is closed and empty. Workers never interrupt a job; a running start
//! callback always returns on its own.

use crate::config::JobsConfig;
use crate::error::JobError;
use crate::job::Task;
use crate::queue::{JobQueue, Pop};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Fixed-size pool of worker threads.
pub(crate) struct WorkerPool {
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<Worker>>,
    num_workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Create the pool; threads are spawned now unless `lazy_start` is set.
    pub(crate) fn new(config: &JobsConfig) -> Result<Self, JobError> {
        let pool = Self {
            queue: Arc::new(JobQueue::new()),
            workers: Mutex::new(Vec::new()),
            num_workers: config.num_workers.max(1),
            poll_interval: config.poll_interval,
        };
        if !config.lazy_start {
            pool.ensure_started()?;
        }
        Ok(pool)
    }

    /// Spawn the worker threads if they are not running yet.
    pub(crate) fn ensure_started(&self) -> Result<(), JobError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        if self.queue.is_closed() {
            return Err(JobError::ShutDown);
        }

        for id in 0..self.num_workers {
            let worker = Worker::spawn(id, self.queue.clone(), self.poll_interval)?;
            workers.push(worker);
        }
        tracing::debug!(workers = workers.len(), "worker pool started");
        Ok(())
    }

    /// Queue a task for the next free worker.
    pub(crate) fn submit(&self, task: Task) -> Result<(), Task> {
        match self.ensure_started() {
            Ok(()) => {}
            Err(JobError::ShutDown) => return Err(task),
            Err(err) => {
                tracing::error!(error = %err, "could not start worker pool");
                return Err(task);
            }
        }
        self.queue.push(task)
    }

    /// Number of worker threads, spawned or not.
    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Shutdown the worker pool gracefully.
    ///
    /// Stops accepting work, lets the workers drain what is already queued,
    /// then waits for them to exit. A worker calling this does not wait for
    /// itself.
    pub(crate) fn shutdown(&self) {
        if !self.queue.is_closed() {
            tracing::debug!(pending = self.queue.len(), "worker pool shutting down");
        }
        self.queue.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A single worker thread in the worker pool.
struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create and start a new worker thread.
    fn spawn(id: usize, queue: Arc<JobQueue>, poll_interval: Duration) -> Result<Self, JobError> {
        let name = format!("jobs-worker-{}", id);
        let thread_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run(&thread_name, &queue, poll_interval))
            .map_err(JobError::Spawn)?;

        Ok(Self {
            name,
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    ///
    /// Pops tasks in FIFO order and runs them; wakes up every
    /// `poll_interval` when idle and exits once the queue is closed and empty.
    fn run(name: &str, queue: &JobQueue, poll_interval: Duration) {
        tracing::debug!(worker = name, "worker started");
        loop {
            match queue.pop_timeout(poll_interval) {
                Pop::Task(task) => {
                    tracing::trace!(worker = name, job_id = task.job().id(), "dispatching job");
                    task.run(name);
                }
                Pop::Empty => continue,
                Pop::Closed => break,
            }
        }
        tracing::debug!(worker = name, "worker stopped");
    }

    /// Wait for the worker thread to finish.
    fn join(mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!(worker = %self.name, "worker thread panicked");
        }
    }
}
