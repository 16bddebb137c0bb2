// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bounded hand-off between probe callbacks and the dispatch loop.
//!
//! Producers run on probe wakeups and must never block or allocate past the
//! channel's capacity; when the queue is full the record is counted and
//! discarded. The consumer drains in FIFO order.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::schema::EventRecord;

/// A bounded MPSC queue of event records with a drop counter.
pub struct EventChannel {
    tx: mpsc::Sender<EventRecord>,
    rx: mpsc::Receiver<EventRecord>,
    drops: Arc<AtomicU64>,
    capacity: usize,
}

impl EventChannel {
    /// Creates a channel holding at most `capacity` undelivered records.
    /// A capacity of zero is clamped to one.
    pub fn with_capacity(capacity: usize) -> EventChannel {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        EventChannel {
            tx,
            rx,
            drops: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A cloneable producer handle. Every probe gets one.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            tx: self.tx.clone(),
            drops: self.drops.clone(),
        }
    }

    /// Enqueues a record, returning whether it was accepted. A full queue
    /// drops the record and bumps the drop counter; the call never waits.
    pub fn submit(&self, record: EventRecord) -> bool {
        submit_inner(&self.tx, &self.drops, record)
    }

    /// Receives everything currently queued, waiting at most `wait` for the
    /// first record. Returns in arrival order; empty if nothing showed up.
    pub async fn drain(&mut self, wait: Duration) -> Vec<EventRecord> {
        let mut records = Vec::new();
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(record)) => records.push(record),
            // Elapsed, or all submitters dropped.
            _ => return records,
        }
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        records
    }

    /// Total records discarded so far, both queue overflow and transport
    /// loss reported by the kernel. Monotonic for the channel's lifetime.
    pub fn pending_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Producer side of an [`EventChannel`]. Cheap to clone; safe to call from
/// any thread, including synchronous probe callbacks.
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::Sender<EventRecord>,
    drops: Arc<AtomicU64>,
}

impl Submitter {
    /// See [`EventChannel::submit`].
    pub fn submit(&self, record: EventRecord) -> bool {
        submit_inner(&self.tx, &self.drops, record)
    }

    /// Folds transport-reported loss (records that never reached the
    /// process) into the channel's drop counter.
    pub fn count_lost(&self, n: u64) {
        self.drops.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pending_drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

fn submit_inner(tx: &mpsc::Sender<EventRecord>, drops: &AtomicU64, record: EventRecord) -> bool {
    if tx.try_send(record).is_ok() {
        true
    } else {
        drops.fetch_add(1, Ordering::Relaxed);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EventRecord, EventSchema, FieldKind};

    fn record(id: i32) -> EventRecord {
        let schema = Arc::new(EventSchema::new("t", &[("id", FieldKind::I32)]));
        EventRecord::decode(&schema, &id.to_ne_bytes()).unwrap()
    }

    #[tokio::test]
    async fn burst_over_capacity_counts_exact_drops() {
        let mut channel = EventChannel::with_capacity(4);
        let submitter = channel.submitter();
        let mut accepted = 0;
        for id in 0..7 {
            if submitter.submit(record(id)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        assert_eq!(channel.pending_drops(), 3);

        let drained = channel.drain(Duration::from_millis(10)).await;
        let ids: Vec<i64> = drained
            .iter()
            .map(|r| r.field("id").unwrap().as_i64())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        // Draining frees capacity again.
        assert!(submitter.submit(record(9)));
        assert_eq!(channel.pending_drops(), 3);
    }

    #[tokio::test]
    async fn drain_times_out_empty() {
        let mut channel = EventChannel::with_capacity(2);
        let drained = channel.drain(Duration::from_millis(5)).await;
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn transport_loss_shares_the_counter() {
        let channel = EventChannel::with_capacity(2);
        let submitter = channel.submitter();
        submitter.count_lost(5);
        assert_eq!(channel.pending_drops(), 5);
        assert_eq!(submitter.pending_drops(), 5);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let channel = EventChannel::with_capacity(0);
        assert_eq!(channel.capacity(), 1);
        assert!(channel.submit(record(1)));
        assert!(!channel.submit(record(2)));
        assert_eq!(channel.pending_drops(), 1);
    }
}
