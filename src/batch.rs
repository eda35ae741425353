//! Bounded, ordered groups of records handed to a [`Transport`](crate::Transport).

use crate::event::{EventRecord, StreamKind};
use serde_json::Value;

/// A contiguous slice of one stream, drained at a single point in time.
///
/// A batch remembers the sequence number of its last record and how often it failed so far.
/// When a submission fails transiently the whole batch goes back to the head of its buffer
/// unchanged, so its boundaries and order survive retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    stream: StreamKind,
    records: Vec<EventRecord>,
    last_seq: u64,
    encoded_len: usize,
    attempts: u32,
}

impl Batch {
    pub(crate) fn new(stream: StreamKind, entries: Vec<(u64, EventRecord)>) -> Self {
        let last_seq = entries.last().map(|(seq, _)| *seq).unwrap_or(0);
        let encoded_len = entries.iter().map(|(_, r)| r.encoded_len()).sum();
        let records = entries.into_iter().map(|(_, record)| record).collect();
        Self { stream, records, last_seq, encoded_len, attempts: 0 }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Borrowed payloads in submission order.
    pub fn payloads(&self) -> impl Iterator<Item = &Value> + '_ {
        self.records.iter().map(EventRecord::payload)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialized size of all payloads, in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Failed submissions so far; `0` on the first attempt.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn into_records(self) -> Vec<EventRecord> {
        self.records
    }

    /// Split off the first `n` records as their own batch, keeping the attempt count on both.
    ///
    /// Records of a batch carry consecutive sequence numbers, so the head ends `len - n`
    /// before this batch does.
    pub(crate) fn split_front(&mut self, n: usize) -> Batch {
        let n = n.min(self.records.len());
        let tail = self.records.split_off(n);
        let head = std::mem::replace(&mut self.records, tail);
        let head_last_seq = self.last_seq.saturating_sub(self.records.len() as u64);
        let head_len: usize = head.iter().map(EventRecord::encoded_len).sum();
        self.encoded_len = self.encoded_len.saturating_sub(head_len);
        Batch {
            stream: self.stream,
            records: head,
            last_seq: head_last_seq,
            encoded_len: head_len,
            attempts: self.attempts,
        }
    }
}

/// Size limits applied when carving a batch off a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl BatchLimits {
    /// Whether a record of `next_len` bytes still fits after `count` records totalling `bytes`.
    /// The first record always fits, however large.
    pub(crate) fn admits(&self, count: usize, bytes: usize, next_len: usize) -> bool {
        if count == 0 {
            return true;
        }
        count < self.max_records && bytes.saturating_add(next_len) <= self.max_bytes
    }
}
