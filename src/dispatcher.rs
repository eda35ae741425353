//! Turns one flush cycle into transport submissions and applies their outcomes.
//!
//! Within a cycle the dispatcher carves batches off the head of its buffer and submits them
//! one at a time, never in parallel, so the backend sees records in enqueue order.
//!
//! - **Success**: the batch is settled and its capacity released.
//! - **Retryable failure** (including a submit timeout): the batch goes back to the head of the
//!   buffer and the cycle ends after a backoff delay. Ending the cycle keeps newer records from
//!   overtaking the failed batch. Once a batch has failed more than `max_retries` times it is
//!   treated as a permanent failure.
//! - **Permanent failure**: the batch is dropped and reported to the sink, and dispatch moves on
//!   to the next batch.

use crate::batch::{Batch, BatchLimits};
use crate::buffer::StreamBuffer;
use crate::config::BatchingConfig;
use crate::error::TransportError;
use crate::event::StreamKind;
use crate::sleeper::Sleeper;
use crate::telemetry::{emit_best_effort, BatchEvent, DropCause, DropReport, PipelineEvent, TelemetrySink};
use crate::transport::{SubmitTimeout, Transport};
use std::sync::Arc;

/// What a single dispatch cycle achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CycleOutcome {
    pub submitted: usize,
    pub dropped: usize,
    /// A batch was requeued and the cycle stopped early.
    pub requeued: bool,
}

pub(crate) struct Dispatcher<S> {
    buffer: Arc<StreamBuffer>,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
    limits: BatchLimits,
    timeout: SubmitTimeout,
    config: BatchingConfig,
}

impl<S: TelemetrySink> Dispatcher<S> {
    pub(crate) fn new(
        buffer: Arc<StreamBuffer>,
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
        sink: S,
        config: BatchingConfig,
    ) -> Self {
        Self {
            buffer,
            transport,
            sleeper,
            sink,
            limits: BatchLimits {
                max_records: config.max_batch_size,
                max_bytes: config.max_batch_bytes,
            },
            timeout: SubmitTimeout::new(config.submit_timeout),
            config,
        }
    }

    fn stream(&self) -> StreamKind {
        self.buffer.stream()
    }

    /// Dispatch everything enqueued up to sequence `through`.
    pub(crate) async fn dispatch(&self, through: u64) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        while let Some(mut batch) = self.buffer.next_batch(self.limits, through) {
            match self.timeout.submit(self.transport.as_ref(), &batch).await {
                Ok(()) => {
                    self.buffer.complete(&batch);
                    outcome.submitted += batch.len();
                    tracing::trace!(stream = %self.stream(), count = batch.len(), "batch submitted");
                    self.emit(PipelineEvent::Batch(BatchEvent::Submitted {
                        stream: self.stream(),
                        size: batch.len(),
                        attempt: batch.attempts(),
                    }))
                    .await;
                }
                Err(err) if err.is_retryable() => {
                    let attempt = batch.record_failure();
                    if attempt > self.config.max_retries {
                        outcome.dropped += batch.len();
                        self.drop_batch(&batch, &err, DropCause::RetriesExhausted).await;
                        continue;
                    }
                    self.requeue(batch, attempt, &err).await;
                    outcome.requeued = true;
                    break;
                }
                Err(err) => {
                    outcome.dropped += batch.len();
                    self.drop_batch(&batch, &err, DropCause::PermanentFailure).await;
                }
            }
        }

        outcome
    }

    async fn requeue(&self, batch: Batch, attempt: u32, err: &TransportError) {
        let size = batch.len();
        tracing::warn!(
            stream = %self.stream(),
            count = size,
            attempt,
            error = %err,
            "batch submit failed, requeued at head"
        );
        self.buffer.requeue_front(batch);
        self.emit(PipelineEvent::Batch(BatchEvent::Requeued {
            stream: self.stream(),
            size,
            attempt,
            reason: err.to_string(),
        }))
        .await;
        self.sleeper.sleep(self.config.retry_backoff.jittered_delay(attempt)).await;
    }

    async fn drop_batch(&self, batch: &Batch, err: &TransportError, cause: DropCause) {
        self.buffer.complete(batch);
        tracing::warn!(
            stream = %self.stream(),
            count = batch.len(),
            attempts = batch.attempts(),
            cause = %cause,
            error = %err,
            "batch dropped"
        );
        self.emit(PipelineEvent::Batch(BatchEvent::Dropped(DropReport {
            stream: self.stream(),
            dropped: batch.len(),
            sample_error: err.to_string(),
            cause,
        })))
        .await;
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
