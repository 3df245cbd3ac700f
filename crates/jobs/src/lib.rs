//! Background job execution.
//!
//! Long-running operations (file loads, layer updates, animation control)
//! are wrapped in [`Job`]s and handed to a [`Manager`], which runs them on a
//! pool of worker threads while the submitting thread stays responsive.
//!
//! - [`Progress`] tracks a job's completion and rate-limits notifications.
//! - [`Job`] owns its start and finish callbacks, its progress, and a
//!   [`CancellationToken`] used for cooperative cancel and pause.
//! - [`Manager`] is the registry of in-flight jobs; it dispatches them FIFO
//!   and notifies [`JobObserver`]s when jobs are added, removed or finish.
//!
//! Every callback runs on a worker thread. Code that must touch UI state is
//! responsible for marshaling back to its own thread.
//!
//! # Example
//!
//! ```
//! use jobkit::{JobError, JobsConfig, Manager};
//! use std::time::Duration;
//!
//! let manager = Manager::new(JobsConfig::new(2)).unwrap();
//!
//! let job = manager
//!     .job()
//!     .name("load scene")
//!     .bounds(0, 3)
//!     .on_start(|job| {
//!         for step in 1..=3 {
//!             job.checkpoint()?;
//!             job.progress().set_value(step);
//!         }
//!         Ok(())
//!     })
//!     .on_finish(|job, outcome| {
//!         println!("{:?}: {:?}", job.name(), outcome);
//!     })
//!     .build();
//!
//! manager.add(&job).unwrap();
//! let outcome = job.wait(Duration::from_secs(5)).unwrap();
//! assert!(outcome.unwrap().is_success());
//!
//! // A job that fails is captured, never thrown back to the caller.
//! let failing = manager
//!     .job()
//!     .on_start(|_job| Err(JobError::failed("corrupt file")))
//!     .build();
//! manager.add(&failing).unwrap();
//! failing.wait(Duration::from_secs(5)).unwrap();
//! assert!(!failing.success());
//! assert_eq!(failing.error().unwrap().to_string(), "corrupt file");
//!
//! manager.shutdown();
//! ```

mod cancel;
mod config;
mod error;
mod job;
mod manager;
mod progress;
mod queue;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use config::{ConfigError, JobsConfig, DEFAULT_POLL_INTERVAL, DEFAULT_PROGRESS_INTERVAL};
pub use error::JobError;
pub use job::{FinishCallback, Job, JobBuilder, JobId, JobOutcome, JobState, StartCallback};
pub use manager::{JobObserver, Manager, ManagerStats, SubscriptionId};
pub use progress::{Progress, ProgressSink};
