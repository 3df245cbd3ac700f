//! Job manager: the registry of in-flight jobs.
//!
//! The [`Manager`] owns the set of jobs that have been submitted and have
//! not yet finished, dispatches them to its worker pool, and fans out
//! added/removed/finished notifications to any number of observers.
//!
//! The manager is an explicitly constructed service. Create it at startup,
//! share it by cloning the handle, and call [`Manager::shutdown`] when
//! done.
//!
//! # Example
//!
//! ```
//! use jobkit::{JobsConfig, Manager};
//! use std::time::Duration;
//!
//! let manager = Manager::new(JobsConfig::new(2)).unwrap();
//! manager.on_job_finished(|job| println!("job {} finished", job.id()));
//!
//! let job = manager
//!     .job()
//!     .name("update layer")
//!     .on_start(|job| {
//!         job.progress().set_value(100);
//!         Ok(())
//!     })
//!     .build();
//!
//! manager.add(&job).unwrap();
//! assert!(manager.wait_all(Duration::from_secs(5)));
//! assert!(job.success());
//!
//! manager.shutdown();
//! ```

use crate::config::JobsConfig;
use crate::error::JobError;
use crate::job::{panic_message, Job, JobBuilder, JobId, JobOutcome, JobState};
use crate::worker::WorkerPool;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives job lifecycle notifications.
///
/// Methods are called synchronously from the thread that changed the
/// registry (the caller of `add`/`remove`, or a worker for
/// `job_finished`), after the registry lock has been released. Observers
/// may call back into the manager.
pub trait JobObserver: Send + Sync {
    /// The job is registered and queued; it may not have started yet.
    fn job_added(&self, _job: &Job) {}

    /// The job was removed and cancelled before it finished.
    fn job_removed(&self, _job: &Job) {}

    /// The job's finish callback has run.
    fn job_finished(&self, _job: &Job) {}
}

/// Handle returned by [`Manager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Total jobs added
    pub jobs_submitted: u64,

    /// Jobs that finished successfully
    pub jobs_succeeded: u64,

    /// Jobs that finished with a captured failure
    pub jobs_failed: u64,

    /// Jobs that finished cancelled
    pub jobs_cancelled: u64,

    /// Jobs currently registered
    pub active: usize,

    /// Registered jobs executing their start callback
    pub running: usize,
}

impl ManagerStats {
    /// Jobs that have finished, whatever the outcome.
    pub fn jobs_finished(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_cancelled
    }
}

#[derive(Default)]
struct Registry {
    jobs: BTreeMap<JobId, Job>,
    stats: ManagerStats,
}

struct Shared {
    config: JobsConfig,
    registry: Mutex<Registry>,
    idle: Condvar,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn JobObserver>)>>,
    next_subscription: AtomicU64,
    shut_down: AtomicBool,
    pool: WorkerPool,
}

/// Registry and dispatcher for background jobs.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    /// Create a manager and its worker pool.
    ///
    /// # Errors
    /// [`JobError::Spawn`] if a worker thread cannot be started.
    pub fn new(config: JobsConfig) -> Result<Self, JobError> {
        let pool = WorkerPool::new(&config)?;
        tracing::debug!(
            workers = pool.num_workers(),
            lazy_start = config.lazy_start,
            "job manager created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::default()),
                idle: Condvar::new(),
                observers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                pool,
            }),
        })
    }

    pub fn config(&self) -> &JobsConfig {
        &self.shared.config
    }

    /// Start building a job whose progress uses the configured interval.
    pub fn job(&self) -> JobBuilder {
        Job::builder().progress_interval(self.shared.config.progress_interval)
    }

    /// Register a job and submit it to the worker pool.
    ///
    /// Returns `Ok(false)` without doing anything if the job is already
    /// registered or was submitted before. `job_added` fires before the
    /// job is handed to a worker, so observers always see it registered.
    ///
    /// # Errors
    /// [`JobError::ShutDown`] after [`Manager::shutdown`].
    pub fn add(&self, job: &Job) -> Result<bool, JobError> {
        if self.is_shut_down() {
            return Err(JobError::ShutDown);
        }

        let task = {
            let mut registry = self.shared.registry.lock();
            if registry.jobs.contains_key(&job.id()) {
                return Ok(false);
            }

            let shared = Arc::downgrade(&self.shared);
            let Some(task) = job.queue(Box::new(move |job: &Job| {
                if let Some(shared) = shared.upgrade() {
                    Manager { shared }.done(job);
                }
            })) else {
                return Ok(false);
            };

            registry.jobs.insert(job.id(), job.clone());
            registry.stats.jobs_submitted += 1;
            task
        };

        tracing::debug!(job_id = job.id(), job_name = job.name(), "job added");
        self.shared.notify(job, |observer, job| observer.job_added(job));

        if let Err(task) = self.shared.pool.submit(task) {
            // Shutdown raced with this add. Finish the job here so the
            // finish callback still runs exactly once.
            tracing::warn!(job_id = job.id(), "worker pool closed; finishing job as cancelled");
            job.cancel();
            task.run("rejected");
            return Err(JobError::ShutDown);
        }
        Ok(true)
    }

    /// Remove a job and request its cancellation.
    ///
    /// Returns `false` if the job is not registered. A running job keeps
    /// running until it reaches a checkpoint; its finish callback and
    /// `job_finished` still fire once it returns.
    pub fn remove(&self, job: &Job) -> bool {
        let removed = {
            let mut registry = self.shared.registry.lock();
            let removed = registry.jobs.remove(&job.id());
            if registry.jobs.is_empty() {
                self.shared.idle.notify_all();
            }
            removed
        };
        let Some(job) = removed else {
            return false;
        };

        job.cancel();
        tracing::debug!(job_id = job.id(), job_name = job.name(), "job removed");
        self.shared.notify(&job, |observer, job| observer.job_removed(job));
        true
    }

    /// Deregister a finished job and fire `job_finished`.
    ///
    /// Normally invoked by the job's dispatch wrapper.
    pub(crate) fn done(&self, job: &Job) {
        self.shared.done(job);
    }

    /// Remove every registered job, most recently created first.
    pub fn clear(&self) {
        loop {
            let last = self.shared.registry.lock().jobs.values().next_back().cloned();
            match last {
                Some(job) => {
                    self.remove(&job);
                }
                None => break,
            }
        }
    }

    /// Remove the jobs that are queued but not yet running.
    ///
    /// Returns how many jobs were removed.
    pub fn clear_queued(&self) -> usize {
        let queued: Vec<Job> = self
            .shared
            .registry
            .lock()
            .jobs
            .values()
            .filter(|job| job.state() == JobState::Queued)
            .cloned()
            .collect();

        queued.iter().filter(|job| self.remove(job)).count()
    }

    /// Request cancellation of every registered job without removing it.
    ///
    /// The jobs deregister normally as they finish. Returns the number of
    /// jobs signalled.
    pub fn cancel_all(&self) -> usize {
        let jobs = self.jobs();
        for job in &jobs {
            job.cancel();
        }
        jobs.len()
    }

    pub fn contains(&self, job: &Job) -> bool {
        self.shared.registry.lock().jobs.contains_key(&job.id())
    }

    /// Number of registered jobs.
    pub fn num_jobs(&self) -> usize {
        self.shared.registry.lock().jobs.len()
    }

    /// Number of registered jobs whose start callback is executing.
    pub fn num_running(&self) -> usize {
        self.count_in_state(JobState::Running)
    }

    /// Number of registered jobs still waiting for a worker.
    pub fn num_queued(&self) -> usize {
        self.count_in_state(JobState::Queued)
    }

    /// Snapshot of the registered jobs in creation order.
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.registry.lock().jobs.values().cloned().collect()
    }

    /// Number of worker threads.
    pub fn pool_size(&self) -> usize {
        self.shared.pool.num_workers()
    }

    pub fn stats(&self) -> ManagerStats {
        let registry = self.shared.registry.lock();
        let mut stats = registry.stats.clone();
        stats.active = registry.jobs.len();
        stats.running = registry
            .jobs
            .values()
            .filter(|job| job.state() == JobState::Running)
            .count();
        stats
    }

    /// Block until no jobs are registered. Returns `false` on timeout.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.shared.registry.lock();
        while !registry.jobs.is_empty() {
            if self.shared.idle.wait_until(&mut registry, deadline).timed_out() {
                return registry.jobs.is_empty();
            }
        }
        true
    }

    /// Install an observer.
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.observers.write().push((id, observer));
        tracing::debug!(subscription = id.0, "observer subscribed");
        id
    }

    /// Remove an observer. Returns `false` if it was not installed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        let removed = observers.len() != before;
        if removed {
            tracing::debug!(subscription = id.0, "observer unsubscribed");
        }
        removed
    }

    /// Subscribe a closure to `job_added`.
    pub fn on_job_added<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnObserver { event: Event::Added, f }))
    }

    /// Subscribe a closure to `job_removed`.
    pub fn on_job_removed<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnObserver { event: Event::Removed, f }))
    }

    /// Subscribe a closure to `job_finished`.
    pub fn on_job_finished<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnObserver { event: Event::Finished, f }))
    }

    /// Remove all jobs, stop accepting new ones, and join the workers.
    ///
    /// Running jobs are cancelled and waited for; their finish callbacks
    /// still run. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(active = self.num_jobs(), "job manager shutting down");
        self.clear();
        self.shared.pool.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    fn count_in_state(&self, state: JobState) -> usize {
        self.shared
            .registry
            .lock()
            .jobs
            .values()
            .filter(|job| job.state() == state)
            .count()
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("jobs", &self.num_jobs())
            .field("workers", &self.pool_size())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Shared {
    fn done(&self, job: &Job) {
        {
            let mut registry = self.registry.lock();
            registry.jobs.remove(&job.id());
            match job.outcome() {
                Some(JobOutcome::Succeeded) => registry.stats.jobs_succeeded += 1,
                Some(JobOutcome::Failed(_)) => registry.stats.jobs_failed += 1,
                Some(JobOutcome::Cancelled) => registry.stats.jobs_cancelled += 1,
                None => {}
            }
            if registry.jobs.is_empty() {
                self.idle.notify_all();
            }
        }
        self.notify(job, |observer, job| observer.job_finished(job));
    }

    /// Call every observer outside the registry lock.
    fn notify<F>(&self, job: &Job, f: F)
    where
        F: Fn(&dyn JobObserver, &Job),
    {
        let observers: Vec<Arc<dyn JobObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref(), job)));
            if let Err(payload) = result {
                tracing::warn!(
                    job_id = job.id(),
                    panic = %panic_message(payload),
                    "job observer panicked"
                );
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !*self.shut_down.get_mut() {
            // Let the pool drain quickly; it is joined when dropped.
            for job in self.registry.get_mut().jobs.values() {
                job.cancel();
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Event {
    Added,
    Removed,
    Finished,
}

struct FnObserver<F> {
    event: Event,
    f: F,
}

impl<F> JobObserver for FnObserver<F>
where
    F: Fn(&Job) + Send + Sync,
{
    fn job_added(&self, job: &Job) {
        if let Event::Added = self.event {
            (self.f)(job);
        }
    }

    fn job_removed(&self, job: &Job) {
        if let Event::Removed = self.event {
            (self.f)(job);
        }
    }

    fn job_finished(&self, job: &Job) {
        if let Event::Finished = self.event {
            (self.f)(job);
        }
    }
}
