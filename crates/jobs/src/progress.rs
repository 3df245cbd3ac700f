//! Rate-limited job progress.
//!
//! A [`Progress`] tracks an integer value inside a `[minimum, maximum]`
//! range plus a free-form status text, and forwards changes to a sink no
//! more than once per update interval. It is a sampling device, not a
//! queue: the latest value always wins and intermediate values that fall
//! inside an interval are dropped.

use crate::config::DEFAULT_PROGRESS_INTERVAL;
use crate::job::{Job, JobInner};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Receives progress notifications for a job.
///
/// Called on whichever thread updated the progress, which is normally a
/// worker thread. Marshaling to a UI thread is the sink's business.
pub type ProgressSink = Arc<dyn Fn(&Job) + Send + Sync>;

/// Progress of a single job.
pub struct Progress {
    owner: Weak<JobInner>,
    state: Mutex<ProgressState>,
    sink: RwLock<Option<ProgressSink>>,
}

#[derive(Debug, Clone)]
struct ProgressState {
    minimum: i64,
    maximum: i64,
    value: i64,
    text: String,
    interval: Duration,
    last_notified_at: Option<Instant>,
    last_notified_value: i64,
}

impl Progress {
    pub(crate) fn new(owner: Weak<JobInner>, interval: Duration, sink: Option<ProgressSink>) -> Self {
        Self {
            owner,
            state: Mutex::new(ProgressState {
                minimum: 0,
                maximum: 100,
                value: 0,
                text: String::new(),
                interval,
                last_notified_at: None,
                last_notified_value: 0,
            }),
            sink: RwLock::new(sink),
        }
    }

    /// Set the range. `minimum <= maximum` is expected but not enforced.
    pub fn set_bounds(&self, minimum: i64, maximum: i64) {
        let mut state = self.state.lock();
        state.minimum = minimum;
        state.maximum = maximum;
    }

    /// Current `(minimum, maximum)`.
    pub fn bounds(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.minimum, state.maximum)
    }

    /// Store a new value and notify the sink if the update interval has
    /// elapsed since the previous notification.
    pub fn set_value(&self, value: i64) {
        let notify = {
            let mut state = self.state.lock();
            state.value = value;
            Self::claim_slot(&mut state, Instant::now())
        };
        if notify {
            self.notify();
        }
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        self.state.lock().value
    }

    /// Set the status text. Shares the rate limit with `set_value`.
    pub fn set_text(&self, text: impl Into<String>) {
        let notify = {
            let mut state = self.state.lock();
            state.text = text.into();
            Self::claim_slot(&mut state, Instant::now())
        };
        if notify {
            self.notify();
        }
    }

    /// Latest status text.
    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    /// `(value - minimum) / (maximum - minimum)`, or `0.0` for an empty range.
    pub fn fraction(&self) -> f64 {
        let state = self.state.lock();
        let span = state.maximum as f64 - state.minimum as f64;
        if span == 0.0 {
            return 0.0;
        }
        (state.value as f64 - state.minimum as f64) / span
    }

    /// `100 * fraction()`.
    pub fn percent(&self) -> f64 {
        100.0 * self.fraction()
    }

    pub fn update_interval(&self) -> Duration {
        self.state.lock().interval
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.state.lock().interval = interval;
    }

    /// Value carried by the most recent notification.
    pub fn last_notified_value(&self) -> i64 {
        self.state.lock().last_notified_value
    }

    /// Replace the notification sink.
    pub fn set_sink(&self, sink: Option<ProgressSink>) {
        *self.sink.write() = sink;
    }

    /// Notify the sink now regardless of the rate limit, e.g. for a final
    /// 100% update. Restarts the interval.
    pub fn force_notify(&self) {
        {
            let mut state = self.state.lock();
            state.last_notified_at = Some(Instant::now());
            state.last_notified_value = state.value;
        }
        self.notify();
    }

    /// Decide whether this update may notify, and if so mark it as sent.
    fn claim_slot(state: &mut ProgressState, now: Instant) -> bool {
        let due = match state.last_notified_at {
            None => true,
            Some(at) => now.duration_since(at) > state.interval,
        };
        if due {
            state.last_notified_at = Some(now);
            state.last_notified_value = state.value;
        }
        due
    }

    fn notify(&self) {
        let Some(sink) = self.sink.read().clone() else {
            return;
        };
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let job = Job::from_inner(inner);
        tracing::trace!(job_id = job.id(), value = self.value(), "progress");
        sink(&job);
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(Weak::new(), DEFAULT_PROGRESS_INTERVAL, None)
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Progress")
            .field("minimum", &state.minimum)
            .field("maximum", &state.maximum)
            .field("value", &state.value)
            .field("text", &state.text)
            .field("interval", &state.interval)
            .finish()
    }
}
