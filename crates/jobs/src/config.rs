//! Job manager configuration.
//!
//! Configuration can be loaded from a file, environment variables,
//! or created programmatically.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Default time a worker waits for a job before re-checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default minimum time between two progress notifications of one job.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a [`Manager`](crate::Manager) and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// Number of worker threads.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time a worker will wait for a job before checking shutdown.
    pub poll_interval: Duration,

    /// Update interval given to the progress of jobs built by the manager.
    pub progress_interval: Duration,

    /// Spawn worker threads on first submission instead of at construction.
    pub lazy_start: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            lazy_start: false,
        }
    }
}

/// On-disk representation; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    num_workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    progress_interval_ms: Option<u64>,
    lazy_start: Option<bool>,
}

impl JobsConfig {
    /// Create a configuration with the given number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    /// Set the number of worker threads.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the default progress update interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Defer spawning workers until the first job is added.
    pub fn with_lazy_start(mut self, lazy_start: bool) -> Self {
        self.lazy_start = lazy_start;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `JOBS_NUM_WORKERS`: worker thread count
    /// - `JOBS_POLL_INTERVAL_MS`: worker poll interval in milliseconds
    /// - `JOBS_PROGRESS_INTERVAL_MS`: progress update interval in milliseconds
    /// - `JOBS_LAZY_START`: `true` or `false`
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("JOBS_NUM_WORKERS")? {
            config.num_workers = n;
        }
        if let Some(ms) = env_parse::<u64>("JOBS_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("JOBS_PROGRESS_INTERVAL_MS")? {
            config.progress_interval = Duration::from_millis(ms);
        }
        if let Some(lazy) = env_parse::<bool>("JOBS_LAZY_START")? {
            config.lazy_start = lazy;
        }

        config.validate("JOBS_NUM_WORKERS")?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// num_workers = 4
    /// poll_interval_ms = 100
    /// progress_interval_ms = 1000
    /// lazy_start = false
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string. Missing keys keep their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(n) = file.num_workers {
            config.num_workers = n;
        }
        if let Some(ms) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.progress_interval_ms {
            config.progress_interval = Duration::from_millis(ms);
        }
        if let Some(lazy) = file.lazy_start {
            config.lazy_start = lazy;
        }

        config.validate("num_workers")?;
        Ok(config)
    }

    fn validate(&self, workers_key: &str) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue(workers_key.to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading the configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not valid TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
