//! One background flush driver per stream kind.
//!
//! A driver owns the decision of *when* its buffer is flushed. It wakes on three sources:
//!
//! - a size signal sent by `report` once the buffer holds `max_batch_size` records,
//! - a periodic tick every `flush_interval`, which flushes only a non-empty buffer,
//! - explicit `flush` / `shutdown` commands from the client.
//!
//! A driver runs at most one flush cycle at a time. Triggers that arrive while a cycle is in
//! progress are coalesced into a single immediate rerun.

use crate::buffer::StreamBuffer;
use crate::dispatcher::Dispatcher;
use crate::telemetry::{FlushEvent, PipelineEvent, TelemetrySink};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Why a flush cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    SizeThreshold,
    TimeInterval,
    ExplicitFlush,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::SizeThreshold => "size_threshold",
            FlushTrigger::TimeInterval => "time_interval",
            FlushTrigger::ExplicitFlush => "explicit_flush",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for a driver to flush.
#[derive(Debug)]
pub(crate) struct FlushCommand {
    pub trigger: FlushTrigger,
    /// Completed once every record enqueued before the command was sent has settled.
    pub done: Option<oneshot::Sender<()>>,
}

impl FlushCommand {
    pub(crate) fn size_threshold() -> Self {
        Self { trigger: FlushTrigger::SizeThreshold, done: None }
    }

    pub(crate) fn with_ack(trigger: FlushTrigger) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { trigger, done: Some(tx) }, rx)
    }
}

pub(crate) struct FlushDriver<S> {
    buffer: Arc<StreamBuffer>,
    dispatcher: Dispatcher<S>,
    interval: Duration,
}

impl<S: TelemetrySink> FlushDriver<S> {
    pub(crate) fn new(buffer: Arc<StreamBuffer>, dispatcher: Dispatcher<S>, interval: Duration) -> Self {
        Self { buffer, dispatcher, interval }
    }

    /// Drive the buffer until a `Shutdown` command arrives or every sender is gone.
    pub(crate) async fn run(self, mut commands: mpsc::Receiver<FlushCommand>) {
        let stream = self.buffer.stream();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(%stream, interval = ?self.interval, "flush driver started");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(FlushCommand { trigger, done }) => {
                        match trigger {
                            FlushTrigger::SizeThreshold | FlushTrigger::TimeInterval => {
                                self.buffer.take_signal();
                                if self.buffer.size() > 0 {
                                    self.flush(trigger).await;
                                }
                            }
                            FlushTrigger::ExplicitFlush | FlushTrigger::Shutdown => {
                                let target = self.buffer.last_seq();
                                self.flush_through(target, trigger).await;
                            }
                        }
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        if trigger == FlushTrigger::Shutdown {
                            break;
                        }
                    }
                    None => {
                        // Client dropped without shutdown: one last best-effort cycle.
                        if self.buffer.size() > 0 {
                            self.flush(FlushTrigger::Shutdown).await;
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.buffer.size() > 0 {
                        self.flush(FlushTrigger::TimeInterval).await;
                    }
                }
            }
        }

        tracing::debug!(%stream, "flush driver stopped");
    }

    /// Run cycles until every record up to `target` has settled.
    async fn flush_through(&self, target: u64, trigger: FlushTrigger) {
        while self.buffer.settled_through() < target {
            if self.buffer.size() == 0 {
                break;
            }
            self.flush(trigger).await;
        }
    }

    /// One flush cycle, repeated while triggers were coalesced during it.
    async fn flush(&self, trigger: FlushTrigger) {
        let stream = self.buffer.stream();
        let mut trigger = trigger;
        loop {
            let through = self.buffer.begin_flush();
            let started = Instant::now();
            let outcome = self.dispatcher.dispatch(through).await;
            let elapsed = started.elapsed();

            tracing::debug!(
                %stream,
                %trigger,
                submitted = outcome.submitted,
                dropped = outcome.dropped,
                requeued = outcome.requeued,
                ?elapsed,
                "flush cycle completed"
            );
            self.dispatcher
                .emit(PipelineEvent::Flush(FlushEvent::Completed {
                    stream,
                    trigger,
                    submitted: outcome.submitted,
                    elapsed,
                }))
                .await;

            if !self.buffer.finish_flush() {
                break;
            }
            trigger = FlushTrigger::SizeThreshold;
        }
    }
}
