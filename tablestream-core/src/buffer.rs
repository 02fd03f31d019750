//! Per-partition accumulation of records awaiting a flush, and the thresholds that decide when the
//! accumulated records must be flushed.

use std::time::Duration;

use tokio::time::Instant;

use crate::record::{Record, Row};

/// When a [PartitionBuffer] must be flushed. Reaching any one of the limits is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferThreshold {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_age: Duration,
}

impl BufferThreshold {
    pub fn new(max_records: usize, max_bytes: usize, max_age: Duration) -> Self {
        Self {
            max_records,
            max_bytes,
            max_age,
        }
    }
}

/// Records accepted for a partition that are not flushed yet.
///
/// A buffer is handed off whole: the channel swaps in an empty buffer with [std::mem::take] and
/// flushes the old one, so nothing is drained partially and a handed off buffer is never appended
/// to again.
#[derive(Debug, Default)]
pub struct PartitionBuffer {
    records: Vec<Record>,
    bytes: usize,
    /// Arrival of the oldest record in the buffer.
    oldest: Option<Instant>,
}

impl PartitionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.bytes += record.estimated_size();
        self.records.push(record);
    }

    pub fn has_reached_threshold(&self, threshold: &BufferThreshold) -> bool {
        if self.records.is_empty() {
            return false;
        }
        self.records.len() >= threshold.max_records
            || self.bytes >= threshold.max_bytes
            || self.has_reached_time_threshold(threshold)
    }

    /// Only the age of the oldest record is considered.
    pub fn has_reached_time_threshold(&self, threshold: &BufferThreshold) -> bool {
        self.oldest
            .is_some_and(|oldest| oldest.elapsed() >= threshold.max_age)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Rows in insertion order, in the shape the ingestion service expects.
    pub fn rows(&self) -> Vec<Row> {
        self.records.iter().map(|r| r.value.clone()).collect()
    }
}
