//! Turns a drained queue into a [`BatchRecord`] and hands it to the transport.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;
use crate::batch_key::BatchKey;
use crate::record::BatchRecord;
use crate::writer::Transport;

/// Why a queue is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The queue reached its action's size threshold.
    Threshold,
    /// The background scheduler found the queue stale.
    Staleness,
    /// An explicit `flush()` call.
    Manual,
    /// The sender is closing.
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushReason::Threshold => "threshold",
            FlushReason::Staleness => "staleness",
            FlushReason::Manual => "manual",
            FlushReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct FlushCounters {
    pub(crate) batches_sent: AtomicU64,
    pub(crate) rows_sent: AtomicU64,
    pub(crate) failed_flushes: AtomicU64,
}

/// Sends batches of one data source.
pub struct Flusher {
    data_source: String,
    transport: Arc<dyn Transport>,
    counters: FlushCounters,
}

impl Flusher {
    pub fn new(data_source: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            data_source: data_source.into(),
            transport,
            counters: FlushCounters::default(),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Send every row in `rows` as one batch.
    ///
    /// The caller holds the queue lock. On success `rows` is left empty; on
    /// failure it is restored untouched so no row is lost or reordered.
    pub fn flush(&self, key: &BatchKey, rows: &mut Vec<String>, reason: FlushReason) -> Result<()> {
        let size = rows.len();
        tracing::info!(
            data_source = %self.data_source,
            action = %key.action(),
            partition = key.partition(),
            size,
            %reason,
            "sending a batch of data"
        );

        let record = BatchRecord::from_key(&self.data_source, key, std::mem::take(rows));
        match self.transport.send(&record) {
            Ok(()) => {
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.rows_sent.fetch_add(size as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                *rows = record.into_payloads();
                Err(e)
            }
        }
    }

    pub(crate) fn counters(&self) -> &FlushCounters {
        &self.counters
    }
}
