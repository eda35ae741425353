//! Convenient re-exports for reporting events.
pub use crate::{
    backoff::{Backoff, Jitter},
    client::{Client, ClientBuilder},
    config::{BackpressurePolicy, BatchingConfig},
    error::{ReportError, TransportError},
    event::{EventRecord, FeedbackScore, SpanData, SpanType, StreamKind, TraceData},
    scheduler::FlushTrigger,
    settings::Settings,
    telemetry::{DropReport, PipelineEvent, TelemetrySink},
    transport::Transport,
    Batch,
};
