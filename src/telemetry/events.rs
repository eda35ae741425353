use crate::event::StreamKind;
use crate::scheduler::FlushTrigger;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the pipeline while it flushes and delivers batches.
///
/// Every decision a flush driver makes is described by one of these. Sinks receive them
/// for logging, aggregation, or assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Per-batch delivery outcomes
    Batch(BatchEvent),
    /// Flush cycle boundaries
    Flush(FlushEvent),
    /// Producer-facing capacity signals
    Backpressure(BackpressureEvent),
}

impl PipelineEvent {
    /// The drop report carried by this event, if it is one.
    pub fn as_drop(&self) -> Option<&DropReport> {
        match self {
            PipelineEvent::Batch(BatchEvent::Dropped(report)) => Some(report),
            _ => None,
        }
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            PipelineEvent::Batch(BatchEvent::Submitted { stream, .. })
            | PipelineEvent::Batch(BatchEvent::Requeued { stream, .. })
            | PipelineEvent::Flush(FlushEvent::Completed { stream, .. })
            | PipelineEvent::Backpressure(BackpressureEvent::Rejected { stream, .. }) => *stream,
            PipelineEvent::Batch(BatchEvent::Dropped(report)) => report.stream,
        }
    }
}

/// Why records left the pipeline without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// The transport rejected the batch as non-retryable.
    PermanentFailure,
    /// The batch kept failing transiently past the retry bound.
    RetriesExhausted,
    /// `shutdown` ran out of time with records still buffered or in flight.
    ShutdownTimeout,
}

impl fmt::Display for DropCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropCause::PermanentFailure => "permanent_failure",
            DropCause::RetriesExhausted => "retries_exhausted",
            DropCause::ShutdownTimeout => "shutdown_timeout",
        })
    }
}

/// Payload of the error-observation hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReport {
    pub stream: StreamKind,
    pub dropped: usize,
    /// First error observed for the dropped records.
    pub sample_error: String,
    pub cause: DropCause,
}

/// Events describing what happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// The transport accepted the batch.
    Submitted {
        stream: StreamKind,
        size: usize,
        /// Number of earlier failed submissions of this batch
        attempt: u32,
    },
    /// The batch failed transiently and went back to the head of its buffer.
    Requeued { stream: StreamKind, size: usize, attempt: u32, reason: String },
    /// The batch was discarded.
    Dropped(DropReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushEvent {
    /// A flush cycle finished.
    Completed {
        stream: StreamKind,
        trigger: FlushTrigger,
        /// Records accepted by the transport during this cycle
        submitted: usize,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureEvent {
    /// A fail-fast `report` was refused because the buffer was full.
    Rejected { stream: StreamKind, capacity: usize },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Batch(event) => write!(f, "Batch::{}", event),
            PipelineEvent::Flush(event) => write!(f, "Flush::{}", event),
            PipelineEvent::Backpressure(event) => write!(f, "Backpressure::{}", event),
        }
    }
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchEvent::Submitted { stream, size, attempt } => {
                write!(f, "Submitted({}, size={}, attempt={})", stream, size, attempt)
            }
            BatchEvent::Requeued { stream, size, attempt, reason } => {
                write!(f, "Requeued({}, size={}, attempt={}, reason={})", stream, size, attempt, reason)
            }
            BatchEvent::Dropped(report) => write!(
                f,
                "Dropped({}, count={}, cause={}, error={})",
                report.stream, report.dropped, report.cause, report.sample_error
            ),
        }
    }
}

impl fmt::Display for FlushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushEvent::Completed { stream, trigger, submitted, elapsed } => write!(
                f,
                "Completed({}, trigger={}, submitted={}, elapsed={:?})",
                stream, trigger, submitted, elapsed
            ),
        }
    }
}

impl fmt::Display for BackpressureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureEvent::Rejected { stream, capacity } => {
                write!(f, "Rejected({}, capacity={})", stream, capacity)
            }
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PipelineEvent into a JSON value for sinks.
pub fn event_to_json(event: &PipelineEvent) -> serde_json::Value {
    match event {
        PipelineEvent::Batch(b) => match b {
            BatchEvent::Submitted { stream, size, attempt } => json!({
                "kind": "batch_submitted",
                "stream": stream.as_str(),
                "size": *size,
                "attempt": *attempt,
            }),
            BatchEvent::Requeued { stream, size, attempt, reason } => json!({
                "kind": "batch_requeued",
                "stream": stream.as_str(),
                "size": *size,
                "attempt": *attempt,
                "reason": reason,
            }),
            BatchEvent::Dropped(report) => json!({
                "kind": "batch_dropped",
                "stream": report.stream.as_str(),
                "dropped": report.dropped,
                "cause": report.cause.to_string(),
                "sample_error": report.sample_error,
            }),
        },
        PipelineEvent::Flush(FlushEvent::Completed { stream, trigger, submitted, elapsed }) => {
            json!({
                "kind": "flush_completed",
                "stream": stream.as_str(),
                "trigger": trigger.to_string(),
                "submitted": *submitted,
                "elapsed_ms": clamp_u64(elapsed.as_millis()),
            })
        }
        PipelineEvent::Backpressure(BackpressureEvent::Rejected { stream, capacity }) => json!({
            "kind": "backpressure_rejected",
            "stream": stream.as_str(),
            "capacity": *capacity,
        }),
    }
}
