//! JSONL sink for `opik-streamer`. Appends one pipeline event per line.
//!
//! Handy for keeping a local record of dropped batches next to the application logs.
//! Always writes; bring your own path.

use opik_streamer::telemetry::{event_to_json, PipelineEvent, TelemetrySink};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

type WriteFuture = Pin<Box<dyn std::future::Future<Output = Result<(), io::Error>> + Send>>;

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    drops_only: bool,
    // Serializes appends so lines from concurrent drivers never interleave.
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Arc::new(path.into()), drops_only: false, write_lock: Arc::default() }
    }

    /// Only write drop reports; everything else is ignored.
    pub fn drops_only(mut self) -> Self {
        self.drops_only = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<PipelineEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = WriteFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        if self.drops_only && event.as_drop().is_none() {
            return Box::pin(async { Ok(()) });
        }
        let path = self.path.clone();
        let lock = self.write_lock.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = lock.lock().await;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(path.as_path()).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), "pipeline event appended");
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
    type SinkFuture = WriteFuture;
}
