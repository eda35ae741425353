//! Observability for the delivery pipeline.
//!
//! Flush drivers describe every decision they take as a [`PipelineEvent`] and hand it to a
//! [`TelemetrySink`]. The sink is also the error-observation hook: permanent failures,
//! exhausted retries and forced drops at shutdown all arrive as
//! [`BatchEvent::Dropped`] carrying a [`DropReport`].
//!
//! # Event Types
//!
//! - **Batch**: `Submitted`, `Requeued`, `Dropped`
//! - **Flush**: `Completed`
//! - **Backpressure**: `Rejected`
//!
//! # Telemetry Sinks
//!
//! `TelemetrySink` is a `tower::Service<PipelineEvent>` so sinks compose like any other
//! service. Emission is best effort; a failing sink never affects delivery.

pub mod events;
pub mod sinks;

pub use events::{
    event_to_json, BackpressureEvent, BatchEvent, DropCause, DropReport, FlushEvent,
    PipelineEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, LogSink, MemorySink, MulticastSink, NonBlockingSink,
    NullSink, TelemetrySink,
};
