//! Jobs: units of asynchronous work.
//!
//! A [`Job`] carries a start callback that does the work on a worker
//! thread, a finish callback that always runs exactly once afterwards, a
//! [`Progress`] and a [`CancellationToken`]. Jobs move through
//! [`JobState::Idle`] → [`JobState::Queued`] → [`JobState::Running`] →
//! [`JobState::Completed`].
//!
//! Cancellation is always cooperative. `cancel()` from inside the start
//! callback makes the next `checkpoint()` fail with
//! [`JobError::Cancelled`], which the callback propagates with `?`.
//! `cancel()` from any other thread sets the same token; a callback that
//! never polls it runs to completion.

use crate::cancel::CancellationToken;
use crate::config::DEFAULT_PROGRESS_INTERVAL;
use crate::error::JobError;
use crate::progress::{Progress, ProgressSink};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Unique job identifier
pub type JobId = u64;

/// Work performed on a worker thread.
pub type StartCallback = Box<dyn FnOnce(&Job) -> Result<(), JobError> + Send>;

/// Runs once after the start callback's outcome is known.
pub type FinishCallback = Box<dyn FnOnce(&Job, &JobOutcome) + Send>;

/// Invoked by the manager once the job has left the worker.
pub(crate) type DoneHook = Box<dyn FnOnce(&Job) + Send>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Constructed, not yet submitted.
    Idle,
    /// Submitted to the worker pool, not yet picked up.
    Queued,
    /// A worker is executing the start callback.
    Running,
    /// Terminal; see [`Job::outcome`].
    Completed,
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded,
    /// The start callback returned an error or panicked.
    Failed(Arc<JobError>),
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }

    pub fn error(&self) -> Option<&Arc<JobError>> {
        match self {
            JobOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Cancelled => "cancelled",
        }
    }
}

/// The worker thread currently executing a job.
#[derive(Debug, Clone)]
struct WorkerHandle {
    thread_id: ThreadId,
    name: String,
}

#[derive(Debug)]
struct Runtime {
    state: JobState,
    outcome: Option<JobOutcome>,
    worker: Option<WorkerHandle>,
    /// Finish callback and deregistration are both complete.
    finished: bool,
}

pub(crate) struct JobInner {
    id: JobId,
    name: Option<String>,
    token: CancellationToken,
    progress: Progress,
    runtime: Mutex<Runtime>,
    finished: Condvar,
    start: Mutex<Option<StartCallback>>,
    finish: Mutex<Option<FinishCallback>>,
}

/// Handle to a job. Cloning is cheap; clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Create a job with only a start callback.
    pub fn new<F>(start: F) -> Self
    where
        F: FnOnce(&Job) -> Result<(), JobError> + Send + 'static,
    {
        Self::builder().on_start(start).build()
    }

    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<JobInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn progress(&self) -> &Progress {
        &self.inner.progress
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn state(&self) -> JobState {
        self.inner.runtime.lock().state
    }

    /// Set once the start callback's outcome is known.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.inner.runtime.lock().outcome.clone()
    }

    /// Captured failure, if the job failed.
    pub fn error(&self) -> Option<Arc<JobError>> {
        self.outcome().and_then(|outcome| outcome.error().cloned())
    }

    /// `true` when the job completed without a captured failure and was
    /// not cancelled.
    pub fn success(&self) -> bool {
        matches!(self.outcome(), Some(JobOutcome::Succeeded))
    }

    /// `true` once the finish callback has run and the job has deregistered.
    pub fn is_done(&self) -> bool {
        self.inner.runtime.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Name of the worker thread executing this job, while it runs.
    pub fn worker(&self) -> Option<String> {
        self.inner
            .runtime
            .lock()
            .worker
            .as_ref()
            .map(|worker| worker.name.clone())
    }

    /// Request cancellation. Idempotent; no-op once completed.
    ///
    /// A queued job will skip its start callback. A running job observes
    /// the request at its next `checkpoint()`.
    pub fn cancel(&self) {
        let runtime = self.inner.runtime.lock();
        if runtime.state == JobState::Completed {
            return;
        }
        let first = !self.inner.token.is_cancelled();
        self.inner.token.cancel();
        if !first {
            return;
        }

        match (&runtime.state, &runtime.worker) {
            (JobState::Running, Some(worker)) if worker.thread_id == thread::current().id() => {
                tracing::debug!(job_id = self.id(), "job cancelled itself");
            }
            (JobState::Running, worker) => {
                tracing::debug!(
                    job_id = self.id(),
                    worker = worker.as_ref().map(|w| w.name.as_str()),
                    "cancellation requested for running job; takes effect at its next checkpoint"
                );
            }
            (state, _) => {
                tracing::debug!(job_id = self.id(), ?state, "job cancelled before start");
            }
        }
    }

    /// Cooperative safe point for the start callback.
    ///
    /// Blocks while the job is paused and fails with
    /// [`JobError::Cancelled`] once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        self.inner.token.checkpoint()
    }

    /// Ask the start callback to block at its next checkpoint.
    pub fn pause(&self) {
        self.inner.token.pause();
    }

    pub fn resume(&self) {
        self.inner.token.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.token.is_paused()
    }

    /// Block until the job is done or `timeout` elapses.
    ///
    /// Returns `Ok(None)` for a job that was never submitted.
    ///
    /// # Errors
    /// [`JobError::WaitOnSelf`] when called from the job's own worker
    /// thread, [`JobError::WaitTimeout`] when the timeout elapses first.
    pub fn wait(&self, timeout: Duration) -> Result<Option<JobOutcome>, JobError> {
        let deadline = Instant::now() + timeout;
        let mut runtime = self.inner.runtime.lock();

        if runtime.state == JobState::Idle {
            return Ok(None);
        }
        if let Some(worker) = &runtime.worker {
            if worker.thread_id == thread::current().id() {
                return Err(JobError::WaitOnSelf);
            }
        }

        while !runtime.finished {
            if self
                .inner
                .finished
                .wait_until(&mut runtime, deadline)
                .timed_out()
                && !runtime.finished
            {
                return Err(JobError::WaitTimeout);
            }
        }
        Ok(runtime.outcome.clone())
    }

    /// Move an idle job to `Queued` and hand back the task that runs it.
    ///
    /// Returns `None` if the job was already submitted; a job is queued at
    /// most once in its lifetime.
    pub(crate) fn queue(&self, on_done: DoneHook) -> Option<Task> {
        let mut runtime = self.inner.runtime.lock();
        if runtime.state != JobState::Idle {
            return None;
        }
        runtime.state = JobState::Queued;
        drop(runtime);

        tracing::debug!(job_id = self.id(), job_name = self.name(), "job queued");
        Some(Task {
            job: self.clone(),
            on_done,
        })
    }

    /// Dispatch wrapper executed by a worker.
    fn run(&self, worker_name: &str, on_done: DoneHook) {
        let start = {
            let mut runtime = self.inner.runtime.lock();
            runtime.worker = Some(WorkerHandle {
                thread_id: thread::current().id(),
                name: worker_name.to_string(),
            });
            if self.inner.token.is_cancelled() {
                None
            } else {
                runtime.state = JobState::Running;
                self.inner.start.lock().take()
            }
        };

        let result = match start {
            Some(start) => {
                tracing::debug!(
                    job_id = self.id(),
                    job_name = self.name(),
                    worker = worker_name,
                    "job started"
                );
                panic::catch_unwind(AssertUnwindSafe(|| start(self)))
                    .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload))))
            }
            None if self.inner.token.is_cancelled() => Err(JobError::Cancelled),
            None => Ok(()),
        };

        let outcome = match result {
            Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
            Err(err) => {
                tracing::warn!(job_id = self.id(), job_name = self.name(), error = %err, "job failed");
                JobOutcome::Failed(Arc::new(err))
            }
            Ok(()) if self.inner.token.is_cancelled() => JobOutcome::Cancelled,
            Ok(()) => JobOutcome::Succeeded,
        };

        {
            let mut runtime = self.inner.runtime.lock();
            runtime.state = JobState::Completed;
            runtime.outcome = Some(outcome.clone());
        }

        if let Some(finish) = self.inner.finish.lock().take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| finish(self, &outcome))) {
                tracing::warn!(
                    job_id = self.id(),
                    panic = %panic_message(payload),
                    "finish callback panicked"
                );
            }
        }

        tracing::debug!(
            job_id = self.id(),
            job_name = self.name(),
            outcome = outcome.label(),
            "job finished"
        );
        on_done(self);

        let mut runtime = self.inner.runtime.lock();
        runtime.worker = None;
        runtime.finished = true;
        self.inner.finished.notify_all();
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// A queued job together with its deregistration hook.
pub(crate) struct Task {
    job: Job,
    on_done: DoneHook,
}

impl Task {
    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn run(self, worker_name: &str) {
        let Task { job, on_done } = self;
        job.run(worker_name, on_done);
    }
}

/// Builder for [`Job`].
///
/// # Example
///
/// ```
/// use jobkit::{Job, JobOutcome};
///
/// let job = Job::builder()
///     .name("load terrain.osg")
///     .bounds(0, 10)
///     .on_start(|job| {
///         for i in 0..=10 {
///             job.checkpoint()?;
///             job.progress().set_value(i);
///         }
///         Ok(())
///     })
///     .on_finish(|job, outcome| {
///         if let JobOutcome::Failed(err) = outcome {
///             eprintln!("{:?} failed: {}", job.name(), err);
///         }
///     })
///     .build();
/// assert_eq!(job.progress().bounds(), (0, 10));
/// ```
pub struct JobBuilder {
    name: Option<String>,
    start: Option<StartCallback>,
    finish: Option<FinishCallback>,
    sink: Option<ProgressSink>,
    bounds: (i64, i64),
    interval: Duration,
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self {
            name: None,
            start: None,
            finish: None,
            sink: None,
            bounds: (0, 100),
            interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl JobBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_start<F>(mut self, start: F) -> Self
    where
        F: FnOnce(&Job) -> Result<(), JobError> + Send + 'static,
    {
        self.start = Some(Box::new(start));
        self
    }

    pub fn on_finish<F>(mut self, finish: F) -> Self
    where
        F: FnOnce(&Job, &JobOutcome) + Send + 'static,
    {
        self.finish = Some(Box::new(finish));
        self
    }

    pub fn on_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Progress range; defaults to `0..=100`.
    pub fn bounds(mut self, minimum: i64, maximum: i64) -> Self {
        self.bounds = (minimum, maximum);
        self
    }

    /// Minimum time between progress notifications.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Job {
        let JobBuilder {
            name,
            start,
            finish,
            sink,
            bounds,
            interval,
        } = self;

        let inner = Arc::new_cyclic(|owner| JobInner {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            name,
            token: CancellationToken::new(),
            progress: Progress::new(owner.clone(), interval, sink),
            runtime: Mutex::new(Runtime {
                state: JobState::Idle,
                outcome: None,
                worker: None,
                finished: false,
            }),
            finished: Condvar::new(),
            start: Mutex::new(start),
            finish: Mutex::new(finish),
        });
        inner.progress.set_bounds(bounds.0, bounds.1);
        Job { inner }
    }
}
