//! The object application code talks to.
//!
//! A [`Client`] owns one [`StreamBuffer`] and one background flush driver per
//! [`StreamKind`], all created eagerly when the client is built. Reporting never waits on the
//! network: records are appended to their stream's buffer and the driver takes it from there.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opik_streamer::{Client, BatchingConfig, TraceData};
//! # use opik_streamer::{Batch, Transport, TransportError};
//! # struct Stdout;
//! # #[async_trait::async_trait]
//! # impl Transport for Stdout {
//! #     async fn submit(&self, batch: &Batch) -> Result<(), TransportError> { Ok(()) }
//! # }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(BatchingConfig::default(), Arc::new(Stdout))?;
//! let trace_id = client.trace(TraceData::named("checkout")).await?;
//! println!("reported {trace_id}");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::buffer::StreamBuffer;
use crate::config::{BatchingConfig, DEFAULT_FLUSH_TIMEOUT, DEFAULT_PROJECT_NAME};
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, ReportError};
use crate::event::{EventRecord, FeedbackScore, SpanData, StreamKind, TraceData};
use crate::scheduler::{FlushCommand, FlushDriver, FlushTrigger};
use crate::settings::Settings;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_best_effort, BackpressureEvent, BatchEvent, DropCause, DropReport, LogSink,
    PipelineEvent, TelemetrySink,
};
use crate::transport::Transport;
use futures::future::join_all;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

struct StreamHandle {
    buffer: Arc<StreamBuffer>,
    commands: mpsc::Sender<FlushCommand>,
}

impl StreamHandle {
    fn signal_size_threshold(&self) {
        // A full channel already holds a pending command that will flush this buffer.
        if self.commands.try_send(FlushCommand::size_threshold()).is_err() {
            tracing::trace!(stream = %self.buffer.stream(), "size signal not delivered");
        }
    }

    async fn request(&self, trigger: FlushTrigger) {
        let (command, done) = FlushCommand::with_ack(trigger);
        if self.commands.send(command).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder<S = LogSink> {
    transport: Arc<dyn Transport>,
    config: BatchingConfig,
    sink: S,
    sleeper: Arc<dyn Sleeper>,
    project_name: String,
    flush_timeout: Duration,
}

impl ClientBuilder<LogSink> {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: BatchingConfig::default(),
            sink: LogSink,
            sleeper: Arc::new(TokioSleeper),
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl<S: TelemetrySink> ClientBuilder<S> {
    pub fn config(mut self, config: BatchingConfig) -> Self {
        self.config = config;
        self
    }

    /// Route pipeline events (including drop reports) to `sink`.
    pub fn sink<S2: TelemetrySink>(self, sink: S2) -> ClientBuilder<S2> {
        ClientBuilder {
            transport: self.transport,
            config: self.config,
            sink,
            sleeper: self.sleeper,
            project_name: self.project_name,
            flush_timeout: self.flush_timeout,
        }
    }

    /// Override how drivers wait between retries.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Project applied to payloads built by [`Client::trace`] and friends when they name none.
    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    /// Bound used by [`Client::end`].
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Take thresholds, project name and flush timeout from resolved settings.
    pub fn settings(self, settings: &Settings) -> Self {
        self.config(settings.batching.clone())
            .project_name(settings.project_name.clone())
            .flush_timeout(settings.flush_timeout)
    }

    /// Validate the configuration and start one flush driver per stream kind.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Client<S>, ConfigError> {
        self.config.validate()?;

        let mut streams = Vec::with_capacity(StreamKind::ALL.len());
        let mut drivers = Vec::with_capacity(StreamKind::ALL.len());
        for stream in StreamKind::ALL {
            let buffer = Arc::new(StreamBuffer::new(
                stream,
                self.config.max_buffered_events,
                self.config.max_batch_size,
            ));
            let dispatcher = Dispatcher::new(
                buffer.clone(),
                self.transport.clone(),
                self.sleeper.clone(),
                self.sink.clone(),
                self.config.clone(),
            );
            let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let driver = FlushDriver::new(buffer.clone(), dispatcher, self.config.flush_interval);
            drivers.push(tokio::spawn(driver.run(rx)));
            streams.push(StreamHandle { buffer, commands });
        }

        tracing::debug!(
            max_batch_size = self.config.max_batch_size,
            flush_interval = ?self.config.flush_interval,
            max_buffered_events = self.config.max_buffered_events,
            backpressure = ?self.config.backpressure,
            "client started"
        );

        Ok(Client {
            config: self.config,
            project_name: self.project_name,
            flush_timeout: self.flush_timeout,
            streams,
            sink: self.sink,
            closed: AtomicBool::new(false),
            drivers: Mutex::new(drivers),
        })
    }
}

/// Reports events and delivers them in ordered, bounded batches.
pub struct Client<S = LogSink> {
    config: BatchingConfig,
    project_name: String,
    flush_timeout: Duration,
    streams: Vec<StreamHandle>,
    sink: S,
    closed: AtomicBool,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client<LogSink> {
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder<LogSink> {
        ClientBuilder::new(transport)
    }

    /// Start a client with the given thresholds, logging pipeline events through `tracing`.
    pub fn new(config: BatchingConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::builder(transport).config(config).build()
    }

    /// Resolve settings from the environment and config file and talk to the REST API.
    #[cfg(feature = "http")]
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_settings(&Settings::from_env()?)
    }

    #[cfg(feature = "http")]
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let transport = crate::transport::http::HttpTransport::from_settings(settings)?;
        Self::builder(Arc::new(transport)).settings(settings).build()
    }
}

impl<S: TelemetrySink> Client<S> {
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records currently queued for `stream`, excluding batches being submitted.
    pub fn buffered(&self, stream: StreamKind) -> usize {
        self.handle(stream).buffer.size()
    }

    fn handle(&self, stream: StreamKind) -> &StreamHandle {
        &self.streams[stream.index()]
    }

    /// Append `record` to its stream.
    ///
    /// When the stream is full this fails with [`ReportError::BufferFull`] under the fail-fast
    /// policy, or waits for capacity under the blocking policy. Transport failures are never
    /// surfaced here.
    pub async fn report(&self, record: EventRecord) -> Result<(), ReportError> {
        if self.is_closed() {
            return Err(ReportError::ClientClosed);
        }
        let handle = self.handle(record.stream());
        match handle.buffer.enqueue(record, self.config.backpressure).await {
            Ok(signal) => {
                if signal {
                    handle.signal_size_threshold();
                }
                Ok(())
            }
            Err(err) => {
                if let Some(event) = rejection(&err) {
                    emit_best_effort(self.sink.clone(), event).await;
                }
                Err(err)
            }
        }
    }

    /// Like [`report`](Self::report) but never suspends, whatever the backpressure policy.
    pub fn try_report(&self, record: EventRecord) -> Result<(), ReportError> {
        if self.is_closed() {
            return Err(ReportError::ClientClosed);
        }
        let handle = self.handle(record.stream());
        match handle.buffer.try_enqueue(record) {
            Ok(signal) => {
                if signal {
                    handle.signal_size_threshold();
                }
                Ok(())
            }
            Err(err) => {
                if let Some(event) = rejection(&err) {
                    // Built-in sinks complete immediately; anything slower is skipped.
                    let _ = emit_best_effort(self.sink.clone(), event).now_or_never();
                }
                Err(err)
            }
        }
    }

    /// Report a trace and return its id.
    pub async fn trace(&self, data: TraceData) -> Result<String, ReportError> {
        let record = data.into_record(&self.project_name);
        let id = record.entity_id().to_string();
        self.report(record).await?;
        Ok(id)
    }

    /// Report a span and return its id. A span without a trace id first reports a trace
    /// built from the span's own fields and attaches itself to it.
    pub async fn span(&self, mut data: SpanData) -> Result<String, ReportError> {
        if data.trace_id.is_none() {
            let trace_id = self.trace(data.implicit_trace()).await?;
            data.trace_id = Some(trace_id);
        }
        let record = data.into_record(&self.project_name);
        let id = record.entity_id().to_string();
        self.report(record).await?;
        Ok(id)
    }

    /// Report feedback scores for traces. Returns how many were accepted.
    pub async fn log_traces_feedback_scores(
        &self,
        scores: impl IntoIterator<Item = FeedbackScore>,
    ) -> Result<usize, ReportError> {
        self.log_feedback_scores(StreamKind::TraceFeedbackScore, scores).await
    }

    /// Report feedback scores for spans. Returns how many were accepted.
    pub async fn log_spans_feedback_scores(
        &self,
        scores: impl IntoIterator<Item = FeedbackScore>,
    ) -> Result<usize, ReportError> {
        self.log_feedback_scores(StreamKind::SpanFeedbackScore, scores).await
    }

    async fn log_feedback_scores(
        &self,
        stream: StreamKind,
        scores: impl IntoIterator<Item = FeedbackScore>,
    ) -> Result<usize, ReportError> {
        let mut accepted = 0;
        for score in scores {
            if let Err(err) = score.validate() {
                tracing::warn!(%stream, error = %err, "feedback score skipped");
                continue;
            }
            self.report(score.into_record(stream, &self.project_name)).await?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Wait until every record reported before this call has been submitted or dropped.
    pub async fn flush(&self) {
        join_all(self.streams.iter().map(|h| h.request(FlushTrigger::ExplicitFlush))).await;
    }

    /// [`flush`](Self::flush) with a deadline. Returns `false` if the deadline passed first;
    /// the flush keeps running in the background.
    pub async fn flush_with_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.flush()).await.is_ok()
    }

    /// Stop accepting events and drain every stream within the configured shutdown bound.
    ///
    /// Returns `true` if everything drained in time. Otherwise the drivers are stopped, the
    /// remaining records are dropped, and a [`DropCause::ShutdownTimeout`] report is emitted
    /// per affected stream. Calling it again is a no-op.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_within(self.config.shutdown_timeout).await
    }

    /// [`shutdown`](Self::shutdown) bounded by the flush timeout instead.
    pub async fn end(&self) -> bool {
        self.shutdown_within(self.flush_timeout).await
    }

    async fn shutdown_within(&self, limit: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        for handle in &self.streams {
            handle.buffer.close();
        }
        let drivers = std::mem::take(&mut *self.drivers.lock().unwrap_or_else(|e| e.into_inner()));
        let started = Instant::now();

        let drain = join_all(self.streams.iter().map(|h| h.request(FlushTrigger::Shutdown)));
        let drained = tokio::time::timeout(limit, drain).await.is_ok();
        if !drained {
            for driver in &drivers {
                driver.abort();
            }
        }
        // Wait for aborted drivers too, so none of them touches a buffer after it is abandoned.
        join_all(drivers).await;

        let mut dropped = 0;
        for handle in &self.streams {
            let lost = handle.buffer.abandon();
            if lost.total() == 0 {
                continue;
            }
            dropped += lost.total();
            let stream = handle.buffer.stream();
            tracing::error!(
                %stream,
                queued = lost.queued,
                in_flight = lost.in_flight,
                limit = ?limit,
                "shutdown did not drain stream, events dropped"
            );
            let report = DropReport {
                stream,
                dropped: lost.total(),
                sample_error: format!("shutdown did not complete within {limit:?}"),
                cause: DropCause::ShutdownTimeout,
            };
            emit_best_effort(self.sink.clone(), PipelineEvent::Batch(BatchEvent::Dropped(report)))
                .await;
        }

        tracing::info!(elapsed = ?started.elapsed(), drained, dropped, "client shut down");
        drained && dropped == 0
    }
}

fn rejection(err: &ReportError) -> Option<PipelineEvent> {
    match err {
        ReportError::BufferFull { stream, capacity } => {
            Some(PipelineEvent::Backpressure(BackpressureEvent::Rejected {
                stream: *stream,
                capacity: *capacity,
            }))
        }
        ReportError::ClientClosed => None,
    }
}
