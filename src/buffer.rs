//! Per-stream ordered buffer with a hard capacity.
//!
//! Capacity is a semaphore with one permit per record, in the manner of a bulkhead: a
//! permit is taken on `enqueue` and only returned once the record reaches a terminal
//! outcome (submitted, dropped, or handed out by `drain`). Records carved into a batch but
//! not yet settled count as in flight, so requeueing a failed batch can never push the
//! buffer over its cap.
//!
//! Every record gets a sequence number at enqueue. Because a stream is dispatched strictly
//! in order, records settle in sequence order too, and "everything up to sequence `n` is
//! settled" is a single comparison.

use crate::batch::{Batch, BatchLimits};
use crate::config::BackpressurePolicy;
use crate::error::ReportError;
use crate::event::{EventRecord, StreamKind};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{Semaphore, TryAcquireError};

#[derive(Debug, Default)]
struct BufferState {
    queued: VecDeque<(u64, EventRecord)>,
    /// A batch that failed transiently; always dispatched before `queued`.
    requeued: Option<Batch>,
    in_flight: usize,
    next_seq: u64,
    settled_through: u64,
    flushing: bool,
    pending_rerun: bool,
    signalled: bool,
    closed: bool,
}

impl BufferState {
    fn size(&self) -> usize {
        self.queued.len() + self.requeued.as_ref().map_or(0, Batch::len)
    }

    /// Take the next batch off the head and count it as in flight.
    ///
    /// A requeued batch always comes first. It keeps its boundaries unless it holds more than
    /// `limits.max_records`, in which case only its head is taken.
    fn carve(&mut self, stream: StreamKind, limits: BatchLimits, through: u64) -> Option<Batch> {
        if let Some(mut requeued) = self.requeued.take() {
            let max = limits.max_records.max(1);
            let batch = if requeued.len() > max {
                let head = requeued.split_front(max);
                self.requeued = Some(requeued);
                head
            } else {
                requeued
            };
            self.in_flight += batch.len();
            return Some(batch);
        }

        let mut count = 0;
        let mut bytes = 0usize;
        for (seq, record) in self.queued.iter() {
            if *seq > through || !limits.admits(count, bytes, record.encoded_len()) {
                break;
            }
            count += 1;
            bytes = bytes.saturating_add(record.encoded_len());
        }
        if count == 0 {
            return None;
        }
        self.in_flight += count;
        let entries: Vec<_> = self.queued.drain(..count).collect();
        Some(Batch::new(stream, entries))
    }

    fn settle(&mut self, batch: &Batch) {
        self.in_flight = self.in_flight.saturating_sub(batch.len());
        self.settled_through = self.settled_through.max(batch.last_seq());
    }
}

/// Records that were still pending when a buffer was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Abandoned {
    pub queued: usize,
    pub in_flight: usize,
}

impl Abandoned {
    pub fn total(&self) -> usize {
        self.queued + self.in_flight
    }
}

#[derive(Debug)]
pub struct StreamBuffer {
    stream: StreamKind,
    capacity: usize,
    flush_threshold: usize,
    permits: Semaphore,
    state: Mutex<BufferState>,
}

impl StreamBuffer {
    /// `flush_threshold` is the size at which `enqueue` asks for a size-triggered flush.
    pub fn new(stream: StreamKind, capacity: usize, flush_threshold: usize) -> Self {
        Self {
            stream,
            capacity,
            flush_threshold,
            permits: Semaphore::new(capacity),
            state: Mutex::new(BufferState { next_seq: 1, ..BufferState::default() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Critical sections never panic, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `record` at the tail.
    ///
    /// Returns `true` when the caller should wake the flush driver for a size-triggered
    /// flush. At most one such signal is outstanding at a time; a threshold crossed while a
    /// flush is running is remembered as a rerun instead.
    pub async fn enqueue(
        &self,
        record: EventRecord,
        policy: BackpressurePolicy,
    ) -> Result<bool, ReportError> {
        let permit = match policy {
            BackpressurePolicy::FailFast => self.permits.try_acquire().map_err(|e| match e {
                TryAcquireError::NoPermits => {
                    ReportError::BufferFull { stream: self.stream, capacity: self.capacity }
                }
                TryAcquireError::Closed => ReportError::ClientClosed,
            })?,
            BackpressurePolicy::Block => {
                self.permits.acquire().await.map_err(|_| ReportError::ClientClosed)?
            }
        };
        // Returned explicitly by `complete` / `abandon`.
        permit.forget();
        self.push(record)
    }

    /// Non-suspending variant of [`enqueue`](Self::enqueue); always fails fast.
    pub fn try_enqueue(&self, record: EventRecord) -> Result<bool, ReportError> {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push(record)
            }
            Err(TryAcquireError::NoPermits) => {
                Err(ReportError::BufferFull { stream: self.stream, capacity: self.capacity })
            }
            Err(TryAcquireError::Closed) => Err(ReportError::ClientClosed),
        }
    }

    /// Append a record whose permit has already been taken.
    fn push(&self, record: EventRecord) -> Result<bool, ReportError> {
        let mut state = self.lock();
        // `close` may have run between acquiring the permit and taking the lock.
        if state.closed {
            drop(state);
            self.permits.add_permits(1);
            return Err(ReportError::ClientClosed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.push_back((seq, record));

        if state.size() < self.flush_threshold {
            return Ok(false);
        }
        if state.flushing {
            state.pending_rerun = true;
            Ok(false)
        } else if state.signalled {
            Ok(false)
        } else {
            state.signalled = true;
            Ok(true)
        }
    }

    /// Remove up to `limit` records from the head, in order.
    ///
    /// Returns fewer than `limit` records only when the buffer holds fewer. Drained records
    /// leave the buffer for good: they count as settled and their capacity is released.
    pub fn drain(&self, limit: usize) -> Vec<EventRecord> {
        let mut drained = Vec::new();
        {
            let mut state = self.lock();
            while drained.len() < limit {
                let limits =
                    BatchLimits { max_records: limit - drained.len(), max_bytes: usize::MAX };
                let Some(batch) = state.carve(self.stream, limits, u64::MAX) else {
                    break;
                };
                state.settle(&batch);
                drained.extend(batch.into_records());
            }
        }
        self.permits.add_permits(drained.len());
        drained
    }

    /// Carve the next batch for dispatch, considering only records with `seq <= through`.
    ///
    /// The batch counts as in flight until it is completed or requeued.
    pub(crate) fn next_batch(&self, limits: BatchLimits, through: u64) -> Option<Batch> {
        self.lock().carve(self.stream, limits, through)
    }

    /// Put a transiently failed batch back at the head.
    pub(crate) fn requeue_front(&self, batch: Batch) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(batch.len());
        debug_assert!(state.requeued.is_none(), "only one batch per stream can be requeued");
        state.requeued = Some(batch);
    }

    /// Mark a batch as settled and release its capacity.
    pub(crate) fn complete(&self, batch: &Batch) {
        self.lock().settle(batch);
        self.permits.add_permits(batch.len());
    }

    /// Records currently queued, including a requeued batch.
    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Sequence number of the most recently enqueued record, `0` if none.
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq - 1
    }

    /// Every record with a sequence number up to this one has been submitted or dropped.
    pub fn settled_through(&self) -> u64 {
        self.lock().settled_through
    }

    /// Enter the flushing state. Returns the snapshot sequence the cycle may dispatch up to.
    pub(crate) fn begin_flush(&self) -> u64 {
        let mut state = self.lock();
        state.flushing = true;
        state.pending_rerun = false;
        state.signalled = false;
        state.next_seq - 1
    }

    /// Leave the flushing state. Returns `true` if a trigger was coalesced during the cycle
    /// and there is still something to flush.
    pub(crate) fn finish_flush(&self) -> bool {
        let mut state = self.lock();
        state.flushing = false;
        let rerun = state.pending_rerun && state.size() > 0;
        state.pending_rerun = false;
        rerun
    }

    /// Clear the outstanding size signal once the driver has picked it up.
    pub(crate) fn take_signal(&self) {
        self.lock().signalled = false;
    }

    /// Stop admitting records. Producers blocked on capacity fail with `ClientClosed`.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.permits.close();
    }

    /// Drop everything still pending and return how much was lost.
    pub(crate) fn abandon(&self) -> Abandoned {
        let lost = {
            let mut state = self.lock();
            let lost = Abandoned { queued: state.size(), in_flight: state.in_flight };
            state.queued.clear();
            state.requeued = None;
            state.in_flight = 0;
            state.settled_through = state.next_seq - 1;
            lost
        };
        self.permits.add_permits(lost.total());
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(n: u64) -> EventRecord {
        EventRecord::new(StreamKind::Trace, format!("t-{n}"), json!({ "n": n }))
    }

    fn ids(records: &[EventRecord]) -> Vec<String> {
        records.iter().map(|r| r.entity_id().to_string()).collect()
    }

    fn limits(max_records: usize) -> BatchLimits {
        BatchLimits { max_records, max_bytes: usize::MAX }
    }

    #[tokio::test]
    async fn drain_preserves_enqueue_order() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 10);
        for n in 0..5 {
            buffer.enqueue(record(n), BackpressurePolicy::FailFast).await.unwrap();
        }
        assert_eq!(buffer.size(), 5);

        let first = buffer.drain(2);
        let rest = buffer.drain(10);
        assert_eq!(ids(&first), ["t-0", "t-1"]);
        assert_eq!(ids(&rest), ["t-2", "t-3", "t-4"]);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.in_flight(), 0);
        assert_eq!(buffer.settled_through(), 5);
        assert!(buffer.drain(3).is_empty());
        assert!(buffer.drain(0).is_empty());
    }

    #[tokio::test]
    async fn drain_releases_capacity() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 2, 10);
        buffer.try_enqueue(record(0)).unwrap();
        buffer.try_enqueue(record(1)).unwrap();
        assert!(buffer.try_enqueue(record(2)).unwrap_err().is_buffer_full());

        assert_eq!(buffer.drain(10).len(), 2);
        buffer.enqueue(record(3), BackpressurePolicy::FailFast).await.unwrap();
        buffer.try_enqueue(record(4)).unwrap();
        assert_eq!(ids(&buffer.drain(10)), ["t-3", "t-4"]);
    }

    #[tokio::test]
    async fn drain_splits_a_requeued_batch_and_fills_up_to_limit() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 10);
        for n in 0..5 {
            buffer.try_enqueue(record(n)).unwrap();
        }
        let batch = buffer.next_batch(limits(3), u64::MAX).unwrap();
        buffer.requeue_front(batch);

        assert_eq!(ids(&buffer.drain(2)), ["t-0", "t-1"]);
        assert_eq!(buffer.settled_through(), 2);
        // The rest of the requeued batch, then fresh records.
        assert_eq!(ids(&buffer.drain(2)), ["t-2", "t-3"]);
        assert_eq!(ids(&buffer.drain(2)), ["t-4"]);
        assert_eq!(buffer.settled_through(), 5);
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn oversized_requeued_batch_is_dispatched_in_pieces() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 10);
        for n in 0..3 {
            buffer.try_enqueue(record(n)).unwrap();
        }
        let mut batch = buffer.next_batch(limits(3), u64::MAX).unwrap();
        batch.record_failure();
        buffer.requeue_front(batch);

        let head = buffer.next_batch(limits(2), u64::MAX).unwrap();
        assert_eq!(ids(head.records()), ["t-0", "t-1"]);
        assert_eq!(head.attempts(), 1);
        assert_eq!(buffer.in_flight(), 2);
        buffer.complete(&head);
        assert_eq!(buffer.settled_through(), 2);

        let tail = buffer.next_batch(limits(2), u64::MAX).unwrap();
        assert_eq!(ids(tail.records()), ["t-2"]);
        buffer.complete(&tail);
        assert_eq!(buffer.settled_through(), 3);
    }

    #[tokio::test]
    async fn fail_fast_rejects_at_capacity() {
        let buffer = StreamBuffer::new(StreamKind::Span, 2, 2);
        buffer.enqueue(record(0), BackpressurePolicy::FailFast).await.unwrap();
        buffer.enqueue(record(1), BackpressurePolicy::FailFast).await.unwrap();

        let err = buffer.enqueue(record(2), BackpressurePolicy::FailFast).await.unwrap_err();
        assert_eq!(err, ReportError::BufferFull { stream: StreamKind::Span, capacity: 2 });
        assert_eq!(buffer.size(), 2);
    }

    #[tokio::test]
    async fn in_flight_records_hold_capacity() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 2, 10);
        buffer.try_enqueue(record(0)).unwrap();
        buffer.try_enqueue(record(1)).unwrap();

        let batch = buffer.next_batch(limits(10), u64::MAX).unwrap();
        assert_eq!(buffer.size(), 0);
        assert!(buffer.try_enqueue(record(2)).unwrap_err().is_buffer_full());

        buffer.complete(&batch);
        assert_eq!(buffer.settled_through(), 2);
        assert!(buffer.try_enqueue(record(2)).is_ok());
    }

    #[tokio::test]
    async fn blocked_producer_resumes_after_completion() {
        let buffer = Arc::new(StreamBuffer::new(StreamKind::Trace, 1, 10));
        buffer.try_enqueue(record(0)).unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.enqueue(record(1), BackpressurePolicy::Block).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let batch = buffer.next_batch(limits(10), u64::MAX).unwrap();
        buffer.complete(&batch);
        producer.await.unwrap().unwrap();
        assert_eq!(buffer.size(), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_producers() {
        let buffer = Arc::new(StreamBuffer::new(StreamKind::Trace, 1, 10));
        buffer.try_enqueue(record(0)).unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.enqueue(record(1), BackpressurePolicy::Block).await })
        };
        tokio::task::yield_now().await;
        buffer.close();
        assert_eq!(producer.await.unwrap(), Err(ReportError::ClientClosed));
        assert_eq!(buffer.try_enqueue(record(2)), Err(ReportError::ClientClosed));
    }

    #[tokio::test]
    async fn push_after_close_is_rejected_and_returns_its_permit() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 2, 10);
        buffer.try_enqueue(record(0)).unwrap();

        // A producer that won its permit just before the buffer closed.
        buffer.permits.try_acquire().unwrap().forget();
        buffer.close();
        assert_eq!(buffer.push(record(1)), Err(ReportError::ClientClosed));

        assert_eq!(buffer.size(), 1);
        assert_eq!(buffer.last_seq(), 1);
        assert_eq!(buffer.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn requeued_batch_goes_before_newer_records() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 10);
        for n in 0..3 {
            buffer.try_enqueue(record(n)).unwrap();
        }
        let mut batch = buffer.next_batch(limits(2), u64::MAX).unwrap();
        buffer.try_enqueue(record(3)).unwrap();

        batch.record_failure();
        buffer.requeue_front(batch);
        assert_eq!(buffer.size(), 4);
        assert_eq!(buffer.in_flight(), 0);

        let again = buffer.next_batch(limits(10), u64::MAX).unwrap();
        assert_eq!(again.attempts(), 1);
        assert_eq!(ids(again.records()), ["t-0", "t-1"]);
        let rest = buffer.next_batch(limits(10), u64::MAX).unwrap();
        assert_eq!(ids(rest.records()), ["t-2", "t-3"]);
    }

    #[tokio::test]
    async fn next_batch_respects_snapshot_and_bytes() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 10);
        for n in 0..4 {
            buffer.try_enqueue(record(n)).unwrap();
        }
        let one = record(0).encoded_len();

        let batch = buffer.next_batch(BatchLimits { max_records: 10, max_bytes: one * 2 }, 3).unwrap();
        assert_eq!(batch.len(), 2);
        let batch = buffer.next_batch(limits(10), 3).unwrap();
        assert_eq!(ids(batch.records()), ["t-2"]);
        assert!(buffer.next_batch(limits(10), 3).is_none(), "t-3 is past the snapshot");
    }

    #[tokio::test]
    async fn size_signal_is_coalesced() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 10, 2);
        assert!(!buffer.try_enqueue(record(0)).unwrap());
        assert!(buffer.try_enqueue(record(1)).unwrap());
        assert!(!buffer.try_enqueue(record(2)).unwrap(), "signal already outstanding");

        let through = buffer.begin_flush();
        assert_eq!(through, 3);
        assert!(!buffer.try_enqueue(record(3)).unwrap(), "flushing: remembered as rerun");
        assert!(buffer.finish_flush());
        assert!(!buffer.finish_flush());
    }

    #[tokio::test]
    async fn abandon_counts_queued_and_in_flight() {
        let buffer = StreamBuffer::new(StreamKind::Trace, 5, 10);
        for n in 0..5 {
            buffer.try_enqueue(record(n)).unwrap();
        }
        let _batch = buffer.next_batch(limits(2), u64::MAX).unwrap();

        let lost = buffer.abandon();
        assert_eq!(lost, Abandoned { queued: 3, in_flight: 2 });
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.settled_through(), buffer.last_seq());
        assert!(buffer.try_enqueue(record(5)).is_ok());
    }
}
