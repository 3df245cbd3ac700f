//! Error types for job execution.

use std::error::Error as StdError;
use std::io;

/// Errors produced by jobs and the job manager.
///
/// A start callback reports failure by returning one of these. The
/// [`JobError::Cancelled`] variant is the cooperative cancellation signal
/// and is never treated as a failure.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Cooperative cancellation was observed.
    #[error("job was cancelled")]
    Cancelled,

    /// The job failed with a message.
    #[error("{0}")]
    Failed(String),

    /// The job failed with an underlying error.
    #[error(transparent)]
    Source(Box<dyn StdError + Send + Sync>),

    /// The start callback panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// `Job::wait` gave up before the job finished.
    #[error("timed out waiting for job to finish")]
    WaitTimeout,

    /// `Job::wait` was called from the thread executing the job.
    #[error("cannot wait for a job from its own worker thread")]
    WaitOnSelf,

    /// The manager no longer accepts jobs.
    #[error("job manager has been shut down")]
    ShutDown,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

impl JobError {
    /// Create a failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    /// Wrap an arbitrary error as a job failure.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        JobError::Source(error.into())
    }

    /// Returns `true` for the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

impl From<io::Error> for JobError {
    fn from(error: io::Error) -> Self {
        JobError::Source(Box::new(error))
    }
}
