//! Event records and the typed payloads that produce them.
//!
//! An [`EventRecord`] is the unit the pipeline buffers, batches and submits. It is immutable
//! once built; the payload is an opaque JSON value as far as the pipeline is concerned.
//! [`TraceData`], [`SpanData`] and [`FeedbackScore`] are convenience builders that fill in
//! ids, timestamps and the project name before turning into records.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;

/// Category of event; each kind is an independently ordered pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Trace,
    Span,
    TraceFeedbackScore,
    SpanFeedbackScore,
}

impl StreamKind {
    /// Every stream kind, in a fixed order. Buffers are created eagerly for each.
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Trace,
        StreamKind::Span,
        StreamKind::TraceFeedbackScore,
        StreamKind::SpanFeedbackScore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Trace => "trace",
            StreamKind::Span => "span",
            StreamKind::TraceFeedbackScore => "trace_feedback_score",
            StreamKind::SpanFeedbackScore => "span_feedback_score",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            StreamKind::Trace => 0,
            StreamKind::Span => 1,
            StreamKind::TraceFeedbackScore => 2,
            StreamKind::SpanFeedbackScore => 3,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reportable unit plus the stream it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    stream: StreamKind,
    entity_id: String,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    encoded_len: usize,
}

impl EventRecord {
    pub fn new(stream: StreamKind, entity_id: impl Into<String>, payload: Value) -> Self {
        let encoded_len = encoded_len(&payload);
        Self { stream, entity_id: entity_id.into(), payload, enqueued_at: Utc::now(), encoded_len }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Size of the payload once serialized as JSON, in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn encoded_len(payload: &Value) -> usize {
    let mut counter = ByteCounter(0);
    // Writing a `Value` into an infallible sink cannot fail.
    let _ = serde_json::to_writer(&mut counter, payload);
    counter.0
}

/// Generate a time-ordered identifier for traces and spans.
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn to_payload<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).unwrap_or_default()
}

/// Error details attached to a failed trace or span.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub exception_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub traceback: String,
}

/// A trace to be created (or completed, when `end_time` is set).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl TraceData {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Fill in the id, start time and project, then wrap as a [`StreamKind::Trace`] record.
    pub fn into_record(mut self, default_project: &str) -> EventRecord {
        let id = self.id.get_or_insert_with(generate_id).clone();
        self.start_time.get_or_insert_with(Utc::now);
        self.project_name.get_or_insert_with(|| default_project.to_string());
        EventRecord::new(StreamKind::Trace, id, to_payload(&self))
    }
}

/// Kind of work a span represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    #[default]
    General,
    Tool,
    Llm,
    Guardrail,
}

/// A span to be created (or completed, when `end_time` is set).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpanData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub span_type: SpanType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl SpanData {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// The trace this span would implicitly create when it has no `trace_id`.
    pub(crate) fn implicit_trace(&self) -> TraceData {
        TraceData {
            name: self.name.clone(),
            project_name: self.project_name.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            input: self.input.clone(),
            output: self.output.clone(),
            metadata: self.metadata.clone(),
            tags: self.tags.clone(),
            error_info: self.error_info.clone(),
            ..TraceData::default()
        }
    }

    /// Fill in the ids, start time and project, then wrap as a [`StreamKind::Span`] record.
    pub fn into_record(mut self, default_project: &str) -> EventRecord {
        let id = self.id.get_or_insert_with(generate_id).clone();
        self.trace_id.get_or_insert_with(generate_id);
        self.start_time.get_or_insert_with(Utc::now);
        self.project_name.get_or_insert_with(|| default_project.to_string());
        EventRecord::new(StreamKind::Span, id, to_payload(&self))
    }
}

/// Source tag the backend uses to tell SDK-logged scores from UI edits.
pub const FEEDBACK_SCORE_SOURCE_SDK: &str = "sdk";

/// A score attached to a trace or span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackScore {
    /// Id of the trace or span being scored.
    pub id: String,
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub source: String,
}

impl FeedbackScore {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            reason: None,
            category_name: None,
            project_name: None,
            source: FEEDBACK_SCORE_SOURCE_SDK.to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.id.is_empty() {
            return Err(ValidationError::MissingTargetId { name: self.name.clone() });
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue { name: self.name.clone() });
        }
        Ok(())
    }

    /// Wrap as a record on the given feedback-score stream.
    pub fn into_record(mut self, stream: StreamKind, default_project: &str) -> EventRecord {
        self.project_name.get_or_insert_with(|| default_project.to_string());
        let id = self.id.clone();
        EventRecord::new(stream, id, to_payload(&self))
    }
}
