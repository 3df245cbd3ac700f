//! FIFO job queue shared by the worker threads.
//!
//! Jobs are dispatched in submission order. Cancelled jobs stay in the
//! queue; the worker that pops them skips the start callback but still
//! runs the finish path, so every queued job is popped exactly once.

use crate::job::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Thread-safe FIFO of queued job tasks.
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    /// No further pushes are accepted; workers drain and exit.
    closed: bool,
}

/// Result of waiting for the next task.
pub(crate) enum Pop {
    Task(Task),
    /// Nothing arrived within the timeout.
    Empty,
    /// The queue is closed and drained.
    Closed,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a task. Fails once the queue is closed.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest task, waiting up to `timeout` for one to arrive.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Pop::Task(task);
            }
            if state.closed {
                return Pop::Closed;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return match state.tasks.pop_front() {
                    Some(task) => Pop::Task(task),
                    None if state.closed => Pop::Closed,
                    None => Pop::Empty,
                };
            }
        }
    }

    /// Stop accepting tasks and wake every waiting worker.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }
}
