// In-memory transport, used for dry runs and tests
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::batch_key::Action;
use crate::record::BatchRecord;
use crate::{IndexSenderError, Result};

/// Keeps every delivered batch in memory.
///
/// Failures can be injected with [`MemoryTransport::fail_next`]; a failed
/// send is not recorded.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<BatchRecord>>,
    failures: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Batches delivered so far, in delivery order.
    pub fn sent(&self) -> Vec<BatchRecord> {
        self.sent.lock().clone()
    }

    pub fn sent_for(&self, action: Action, partition: u32) -> Vec<BatchRecord> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.action == action && r.partition == partition)
            .cloned()
            .collect()
    }

    pub fn batch_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn row_count(&self) -> usize {
        self.sent.lock().iter().map(BatchRecord::len).sum()
    }

    /// Remove and return everything delivered so far.
    pub fn take(&self) -> Vec<BatchRecord> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl super::Transport for MemoryTransport {
    fn send(&self, record: &BatchRecord) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(IndexSenderError::Transport(format!(
                "injected failure for {} batch on partition {}",
                record.action, record.partition
            )));
        }

        tracing::debug!(
            action = %record.action,
            partition = record.partition,
            size = record.len(),
            "memory transport accepted batch"
        );
        self.sent.lock().push(record.clone());
        Ok(())
    }
}
