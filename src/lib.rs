#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # opik-streamer
//!
//! Client-side event batching and delivery for the Opik observability SDK.
//!
//! Application code reports traces, spans and feedback scores; the client buffers them per
//! stream kind and delivers them in bulk without ever blocking on the network.
//!
//! ## Guarantees
//!
//! - **Ordered per stream**: records of one [`StreamKind`] reach the [`Transport`] in the order
//!   they were reported, across batch boundaries and retries.
//! - **At least once under success**: nothing reported is lost while the transport accepts
//!   batches. There is no deduplication and no persistence across restarts.
//! - **Bounded**: each stream holds at most `max_buffered_events` records, queued or in
//!   flight. Beyond that `report` fails with [`ReportError::BufferFull`] or waits, per
//!   [`BackpressurePolicy`].
//! - **Bounded latency**: a record is flushed within `flush_interval` even when traffic is low.
//! - **Terminating shutdown**: [`Client::shutdown`] returns within its bound whatever the
//!   transport does; anything left behind is reported through the [`TelemetrySink`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opik_streamer::{Client, SpanData, TraceData};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::from_env()?;
//!
//!     let trace_id = client.trace(TraceData::named("rag-pipeline")).await?;
//!     client
//!         .span(SpanData { trace_id: Some(trace_id), ..SpanData::named("retrieve") })
//!         .await?;
//!
//!     client.flush().await;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod buffer;
pub mod client;
pub mod config;
mod dispatcher;
pub mod error;
pub mod event;
pub mod prelude;
pub mod scheduler;
pub mod settings;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError, Jitter};
pub use batch::Batch;
pub use buffer::StreamBuffer;
pub use client::{Client, ClientBuilder};
pub use config::{BackpressurePolicy, BatchingConfig};
pub use error::{ConfigError, ReportError, TransportError, ValidationError};
pub use event::{
    generate_id, ErrorInfo, EventRecord, FeedbackScore, SpanData, SpanType, StreamKind, TraceData,
    FEEDBACK_SCORE_SOURCE_SDK,
};
pub use scheduler::FlushTrigger;
pub use settings::{Settings, SettingsBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{
    event_to_json, BackpressureEvent, BatchEvent, DropCause, DropReport, FlushEvent, LogSink,
    MemorySink, MulticastSink, NonBlockingSink, NullSink, PipelineEvent, TelemetrySink,
};
pub use transport::{SubmitTimeout, Transport};

#[cfg(feature = "http")]
pub use transport::http::HttpTransport;
