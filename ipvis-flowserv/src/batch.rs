//! Flow record batching.
//!
//! Records accumulate in a single bounded batch. After every append the
//! batch is flushed when it is full or when more than `min_rate` has passed
//! since the previous flush. There is no timer: an idle capture never
//! flushes, which caps the send rate without bounding flush latency.

use crate::classify::{FlowRecord, LocalNetwork};
use crate::wire::{FlowBatch, MAX_BATCH_RECORDS};
use std::time::{Duration, Instant};

/// Minimum spacing between time-triggered flushes (about 24 sends per second).
pub const MIN_RATE: Duration = Duration::from_millis(41);

/// Default number of records per batch.
pub const DEFAULT_BATCH_CAPACITY: usize = 170;

/// Owner of the live flow batch.
#[derive(Debug)]
pub struct FlowBatcher {
    batch: FlowBatch,
    capacity: usize,
    min_rate: Duration,
    last_flush: Instant,
}

impl FlowBatcher {
    /// Create an empty batcher. `now` counts as the last flush.
    ///
    /// `capacity` is clamped to `1..=MAX_BATCH_RECORDS`.
    pub fn new(local: &LocalNetwork, capacity: usize, min_rate: Duration, now: Instant) -> Self {
        let capacity = capacity.clamp(1, MAX_BATCH_RECORDS);
        FlowBatcher {
            batch: FlowBatch::new(local.base(), local.prefix_len(), capacity),
            capacity,
            min_rate,
            last_flush: now,
        }
    }

    /// Add a record and apply the flush policy.
    ///
    /// Returns the encoded FLOW datagram when the batch was flushed.
    pub fn append(&mut self, record: FlowRecord, now: Instant) -> Option<Vec<u8>> {
        self.batch.records.push(record);

        let full = self.batch.records.len() >= self.capacity;
        let stale = now.saturating_duration_since(self.last_flush) > self.min_rate;
        if full || stale {
            Some(self.flush(now))
        } else {
            None
        }
    }

    /// Encode the batch, reset it to empty and record the flush time.
    pub fn flush(&mut self, now: Instant) -> Vec<u8> {
        let datagram = self.batch.to_datagram();
        self.batch.records.clear();
        self.last_flush = now;
        datagram
    }

    pub fn len(&self) -> usize {
        self.batch.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    /// Records pending in the live batch, in arrival order.
    pub fn records(&self) -> &[FlowRecord] {
        &self.batch.records
    }
}
