//! The network seam: submit one batch, get one outcome.
//!
//! Implementations must not retry internally. Retrying, requeueing and ordering are owned by
//! the dispatcher so that every guarantee about a stream lives in one place.

use crate::batch::Batch;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "http")]
pub mod http;

/// Performs the network call for one batch.
///
/// The same transport is shared by every stream's flush driver, so `submit` may be called
/// concurrently for different stream kinds.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError>;
}

/// Bounds a single `submit` call. Elapsing is reported as [`TransportError::Timeout`].
#[derive(Debug, Clone, Copy)]
pub struct SubmitTimeout {
    limit: Duration,
}

impl SubmitTimeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub async fn submit(
        &self,
        transport: &dyn Transport,
        batch: &Batch,
    ) -> Result<(), TransportError> {
        let start = Instant::now();

        match tokio::time::timeout(self.limit, transport.submit(batch)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { elapsed: start.elapsed(), limit: self.limit }),
        }
    }
}
