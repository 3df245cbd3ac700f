//! Cancellation token system for jobs
//!
//! Provides cancellation tokens that allow running jobs to be cancelled and
//! paused cooperatively. A job's start callback polls its token at safe
//! points; nothing in this crate ever interrupts or suspends a thread.

use crate::error::JobError;
use parking_lot::{Condvar, Mutex};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation token for cooperative job cancellation
///
/// Workers can periodically call `checkpoint()` (or check `is_cancelled()`)
/// to determine if they should stop processing. Multiple tokens can share
/// the same underlying state via Arc.
///
/// # Example
///
/// ```
/// use jobkit::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// // In worker thread:
/// // for chunk in chunks {
/// //     worker_token.checkpoint()?;
/// //     // ... do work ...
/// // }
///
/// // In main thread:
/// token.cancel();
/// assert!(worker_token.checkpoint().is_err());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    gate: Condvar,
}

impl CancellationToken {
    /// Create a new cancellation token
    ///
    /// The token starts neither cancelled nor paused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token
    ///
    /// All clones of this token will also observe the cancellation, and any
    /// thread blocked in `checkpoint()` on a paused token is woken up.
    /// This operation is idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        // Take the gate lock so a checkpoint between its flag check and its
        // wait cannot miss the wakeup.
        let _paused = self.inner.paused.lock();
        self.inner.gate.notify_all();
    }

    /// Check if this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Ask the holder to pause at its next checkpoint.
    pub fn pause(&self) {
        *self.inner.paused.lock() = true;
    }

    /// Release a paused holder.
    pub fn resume(&self) {
        let mut paused = self.inner.paused.lock();
        *paused = false;
        self.inner.gate.notify_all();
    }

    /// Check if a pause has been requested
    pub fn is_paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    /// Cooperative safe point.
    ///
    /// Blocks while the token is paused, then returns
    /// `Err(JobError::Cancelled)` if the token has been cancelled.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let mut paused = self.inner.paused.lock();
        while *paused && !self.is_cancelled() {
            self.inner.gate.wait(&mut paused);
        }
        drop(paused);

        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("paused", &self.is_paused())
            .finish()
    }
}
