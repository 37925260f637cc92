//! Concurrent cache of pending rows, one ordered queue per [`BatchKey`].
//!
//! Queues are created on first use and never removed; a flush drains a queue
//! in place. Each queue carries its own mutex, so appends and flushes for
//! different keys never contend. Appending, checking the size, sending and
//! clearing a queue all happen under that queue's mutex.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::batch_key::BatchKey;
use crate::flusher::{FlushReason, Flusher};
use crate::{IndexSenderError, Result};

/// Rows of one queue plus its flush bookkeeping.
#[derive(Debug)]
pub struct QueueState {
    rows: Vec<String>,
    last_flush: Instant,
}

impl QueueState {
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    fn flush(&mut self, key: &BatchKey, flusher: &Flusher, reason: FlushReason) -> Result<()> {
        flusher.flush(key, &mut self.rows, reason)?;
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// One queue of serialized row payloads, guarded by its own lock.
#[derive(Debug)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                rows: Vec::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of draining several queues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Queues whose batch was delivered.
    pub flushed: usize,
    /// Queues whose send failed; their rows are still pending.
    pub failed: usize,
}

pub(crate) struct Drained {
    pub(crate) summary: DrainSummary,
    pub(crate) first_error: Option<IndexSenderError>,
}

#[derive(Debug, Default)]
pub struct PendingCache {
    queues: DashMap<BatchKey, Arc<PendingQueue>>,
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `key`, created atomically together with its lock if absent.
    pub fn queue(&self, key: &BatchKey) -> Arc<PendingQueue> {
        if let Some(queue) = self.queues.get(key) {
            return queue.value().clone();
        }
        self.queues
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(key = %key, "creating pending queue");
                Arc::new(PendingQueue::new())
            })
            .value()
            .clone()
    }

    /// Append `payload` to the queue of `key` and flush the whole queue when
    /// it reaches `threshold`.
    ///
    /// Returns `Ok(true)` when this append triggered a delivered batch. A send
    /// failure is returned to the caller; the rows, this one included, stay
    /// queued.
    pub fn append(
        &self,
        key: &BatchKey,
        payload: String,
        threshold: usize,
        flusher: &Flusher,
    ) -> Result<bool> {
        let queue = self.queue(key);
        let mut state = queue.lock();
        state.rows.push(payload);
        if state.rows.len() < threshold {
            return Ok(false);
        }
        state.flush(key, flusher, FlushReason::Threshold)?;
        Ok(true)
    }

    /// Flush every non-empty queue not flushed within `max_staleness`.
    ///
    /// Failures are logged; the affected rows stay queued for the next scan.
    pub fn flush_stale(&self, max_staleness: Duration, flusher: &Flusher) -> DrainSummary {
        self.flush_stale_at(Instant::now(), max_staleness, flusher)
    }

    pub(crate) fn flush_stale_at(
        &self,
        now: Instant,
        max_staleness: Duration,
        flusher: &Flusher,
    ) -> DrainSummary {
        self.drain_where(flusher, FlushReason::Staleness, |state| {
            now.saturating_duration_since(state.last_flush) >= max_staleness
        })
        .summary
    }

    /// Flush every non-empty queue regardless of age.
    pub(crate) fn drain(&self, flusher: &Flusher, reason: FlushReason) -> Drained {
        self.drain_where(flusher, reason, |_| true)
    }

    fn drain_where<F>(&self, flusher: &Flusher, reason: FlushReason, due: F) -> Drained
    where
        F: Fn(&QueueState) -> bool,
    {
        let mut drained = Drained {
            summary: DrainSummary::default(),
            first_error: None,
        };

        for (key, queue) in self.snapshot() {
            let mut state = queue.lock();
            // A threshold flush may have emptied the queue since the snapshot.
            if state.rows.is_empty() || !due(&*state) {
                continue;
            }
            match state.flush(&key, flusher, reason) {
                Ok(()) => drained.summary.flushed += 1,
                Err(e) => {
                    tracing::error!(
                        data_source = %flusher.data_source(),
                        key = %key,
                        %reason,
                        error = %e,
                        "failed to send batch, rows stay queued"
                    );
                    drained.summary.failed += 1;
                    drained.first_error.get_or_insert(e);
                }
            }
        }

        drained
    }

    /// Point-in-time list of every known queue.
    pub fn snapshot(&self) -> Vec<(BatchKey, Arc<PendingQueue>)> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Rows currently pending for `key`, in send order.
    pub fn pending(&self, key: &BatchKey) -> Vec<String> {
        // Release the shard guard before waiting on the queue lock.
        let queue = self.queues.get(key).map(|entry| entry.value().clone());
        queue.map(|queue| queue.lock().rows.clone()).unwrap_or_default()
    }

    /// Number of queues ever created.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Total rows waiting across all queues.
    pub fn pending_rows(&self) -> usize {
        self.snapshot().iter().map(|(_, queue)| queue.len()).sum()
    }
}
