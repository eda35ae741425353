use async_trait::async_trait;
use opik_streamer::{Batch, EventRecord, StreamKind, Transport, TransportError};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub fn record(stream: StreamKind, id: impl Into<String>) -> EventRecord {
    let id = id.into();
    EventRecord::new(stream, id.clone(), json!({ "id": id }))
}

pub fn trace(n: usize) -> EventRecord {
    record(StreamKind::Trace, format!("t-{n}"))
}

/// One call to `submit` as seen by a test transport.
#[derive(Debug, Clone)]
pub struct Submission {
    pub stream: StreamKind,
    pub ids: Vec<String>,
    pub attempt: u32,
    pub at: Instant,
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct Log {
    submissions: Mutex<Vec<Submission>>,
}

impl Log {
    fn push(&self, batch: &Batch, accepted: bool) {
        self.submissions.lock().unwrap().push(Submission {
            stream: batch.stream(),
            ids: batch.records().iter().map(|r| r.entity_id().to_string()).collect(),
            attempt: batch.attempts(),
            at: Instant::now(),
            accepted,
        });
    }

    fn all(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }
}

fn accepted_ids(submissions: &[Submission], stream: StreamKind) -> Vec<String> {
    submissions
        .iter()
        .filter(|s| s.accepted && s.stream == stream)
        .flat_map(|s| s.ids.clone())
        .collect()
}

/// Accepts every batch and remembers it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    log: Log,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.log.all()
    }

    /// Ids delivered for `stream`, concatenated across batches.
    pub fn delivered(&self, stream: StreamKind) -> Vec<String> {
        accepted_ids(&self.log.all(), stream)
    }

    pub fn batch_sizes(&self, stream: StreamKind) -> Vec<usize> {
        self.log.all().iter().filter(|s| s.stream == stream).map(|s| s.ids.len()).collect()
    }

    /// Poll until `count` records of `stream` were delivered.
    pub async fn wait_for(&self, stream: StreamKind, count: usize) {
        for _ in 0..1000 {
            if self.delivered(stream).len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} {stream} records");
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        self.log.push(batch, true);
        Ok(())
    }
}

/// What a scripted transport does with one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Retryable,
    Permanent,
    /// Never completes; only the submit timeout or shutdown ends it.
    Hang,
}

/// Plays a script of outcomes, then repeats `fallback` forever.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    calls: AtomicUsize,
    log: Log,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Behavior>, fallback: Behavior) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            log: Log::default(),
        }
    }

    pub fn always(behavior: Behavior) -> Self {
        Self::new(Vec::new(), behavior)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.log.all()
    }

    pub fn delivered(&self, stream: StreamKind) -> Vec<String> {
        accepted_ids(&self.log.all(), stream)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior =
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());
        self.log.push(batch, behavior == Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Retryable => Err(TransportError::retryable("503 Service Unavailable")),
            Behavior::Permanent => Err(TransportError::permanent("422 Unprocessable Entity")),
            Behavior::Hang => futures::future::pending().await,
        }
    }
}

/// Holds every submission until the test opens the gate.
#[derive(Debug)]
pub struct GatedTransport {
    gate: Semaphore,
    log: Log,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self { gate: Semaphore::new(0), log: Log::default() }
    }

    /// Let `n` pending or future submissions through.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn delivered(&self, stream: StreamKind) -> Vec<String> {
        accepted_ids(&self.log.all(), stream)
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(TransportError::retryable("gate closed")),
        }
        self.log.push(batch, true);
        Ok(())
    }
}
