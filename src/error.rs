//! Error types for the batching pipeline.
//!
//! Only capacity and lifecycle violations ([`ReportError`]) ever reach the code that reports
//! events. Transport failures ([`TransportError`]) stay inside the pipeline, where they are
//! turned into requeues or reported drops.
use crate::event::StreamKind;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced synchronously to producers calling `report`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    /// The stream buffer is at capacity and the backpressure policy is fail-fast.
    #[error("{stream} buffer is full ({capacity} events buffered or in flight)")]
    BufferFull { stream: StreamKind, capacity: usize },
    /// The client has been shut down and no longer accepts events.
    #[error("client is closed")]
    ClientClosed,
}

impl ReportError {
    /// Check if this error is a backpressure signal the caller may retry.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, Self::BufferFull { .. })
    }

    /// Check if this error means the client is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClientClosed)
    }
}

/// Outcome of a failed [`Transport::submit`](crate::transport::Transport::submit) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient condition; resubmitting the same batch may succeed.
    #[error("retryable transport failure: {0}")]
    Retryable(String),
    /// The batch will never be accepted without external change.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
    /// The submit call did not complete within the configured limit.
    #[error("submit timed out after {elapsed:?} (limit: {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },
}

impl TransportError {
    /// Build a retryable failure from any displayable reason.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    /// Build a permanent failure from any displayable reason.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Timeouts are treated like any other transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced while validating or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment variable {name}: {reason}")]
    Env { name: String, reason: String },
}

/// A typed payload was rejected before it reached a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("feedback score name must not be empty")]
    EmptyName,
    #[error("feedback score '{name}' has a non-finite value")]
    NonFiniteValue { name: String },
    #[error("feedback score '{name}' is missing the id of the entity it scores")]
    MissingTargetId { name: String },
}
