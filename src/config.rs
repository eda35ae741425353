//! Resolved batching thresholds consumed by the pipeline.
//!
//! A [`BatchingConfig`] is immutable for the lifetime of a client. How the values were
//! obtained (constructor, environment, file) is the concern of [`crate::settings`].

use crate::backoff::Backoff;
use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

/// What `report` does when a stream buffer is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Return [`ReportError::BufferFull`](crate::ReportError::BufferFull) immediately.
    #[default]
    FailFast,
    /// Suspend the caller until a flush frees capacity.
    Block,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_fast" | "fail-fast" | "failfast" => Ok(Self::FailFast),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown backpressure policy '{other}' (expected block or fail_fast)")),
        }
    }
}

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_BUFFERED_EVENTS: usize = 10_000;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound used by `Client::end`.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROJECT_NAME: &str = "Default Project";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Upper bound on records per submitted batch; also the size-trigger threshold.
    pub max_batch_size: usize,
    /// Period of the time trigger.
    pub flush_interval: Duration,
    /// Hard cap on records buffered or in flight, per stream kind.
    pub max_buffered_events: usize,
    /// Upper bound on serialized payload bytes per batch. A single larger record is sent alone.
    pub max_batch_bytes: usize,
    /// Requeues allowed per batch before it is converted into a permanent failure.
    pub max_retries: u32,
    pub backpressure: BackpressurePolicy,
    /// Limit on a single `Transport::submit` call; elapsing counts as a retryable failure.
    pub submit_timeout: Duration,
    /// Bound on the forced drain performed by `shutdown`.
    pub shutdown_timeout: Duration,
    pub retry_backoff: Backoff,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_buffered_events: DEFAULT_MAX_BUFFERED_EVENTS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            backpressure: BackpressurePolicy::default(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            retry_backoff: Backoff::default(),
        }
    }
}

impl BatchingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue("max_batch_size must be > 0".into()));
        }
        if self.max_buffered_events < self.max_batch_size {
            return Err(ConfigError::InvalidValue(format!(
                "max_buffered_events ({}) must be >= max_batch_size ({})",
                self.max_buffered_events, self.max_batch_size
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidValue("flush_interval must be > 0".into()));
        }
        if self.max_batch_bytes == 0 {
            return Err(ConfigError::InvalidValue("max_batch_bytes must be > 0".into()));
        }
        if self.submit_timeout.is_zero() || self.shutdown_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("timeouts must be > 0".into()));
        }
        // tokio's semaphore cannot hand out more permits than this.
        if self.max_buffered_events > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidValue("max_buffered_events is too large".into()));
        }
        Ok(())
    }
}
