//! Shared senders, one per server and data source.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::Result;
use crate::pending_cache::DrainSummary;
use crate::sender::DataSender;

/// Identity of a shared sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId {
    pub server: String,
    pub data_source: String,
}

impl SenderId {
    pub fn new(server: &str, data_source: &str) -> Self {
        Self {
            server: server.trim().to_string(),
            data_source: data_source.trim().to_string(),
        }
    }
}

/// One sender slot; its lock serializes builds for a single pair.
type Slot = Arc<Mutex<Option<Arc<DataSender>>>>;

/// Registry of live senders owned by the application.
///
/// Concurrent lookups for the same pair always observe one sender. A sender
/// that was closed through another handle is rebuilt on the next lookup.
#[derive(Default)]
pub struct SenderRegistry {
    slots: DashMap<SenderId, Slot>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sender for `(server, data_source)`, built with `build` if there
    /// is none yet.
    ///
    /// Concurrent callers for the same pair wait for one `build` instead of
    /// building a second sender. Lookups for other pairs are not held up by
    /// it.
    pub fn get_or_try_insert_with<F>(
        &self,
        server: &str,
        data_source: &str,
        build: F,
    ) -> Result<Arc<DataSender>>
    where
        F: FnOnce() -> Result<DataSender>,
    {
        let slot = self.slot(SenderId::new(server, data_source));
        let mut current = slot.lock();
        match current.as_ref() {
            Some(sender) if !sender.is_closed() => return Ok(sender.clone()),
            Some(_) => tracing::debug!(server, data_source, "replacing closed sender"),
            None => {}
        }
        let sender = Arc::new(build()?);
        *current = Some(sender.clone());
        Ok(sender)
    }

    pub fn get(&self, server: &str, data_source: &str) -> Option<Arc<DataSender>> {
        let slot = self
            .slots
            .get(&SenderId::new(server, data_source))
            .map(|entry| entry.value().clone())?;
        let current = slot.lock();
        current.clone()
    }

    /// Forget a sender without closing it.
    pub fn remove(&self, server: &str, data_source: &str) -> Option<Arc<DataSender>> {
        let (_, slot) = self.slots.remove(&SenderId::new(server, data_source))?;
        let sender = slot.lock().take();
        sender
    }

    /// Number of registered senders.
    pub fn len(&self) -> usize {
        self.occupied().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered sender and empty the registry.
    pub fn close_all(&self) -> DrainSummary {
        let ids: Vec<SenderId> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut total = DrainSummary::default();
        for id in ids {
            let Some((_, slot)) = self.slots.remove(&id) else {
                continue;
            };
            let sender = slot.lock().take();
            if let Some(sender) = sender {
                let summary = sender.close();
                total.flushed += summary.flushed;
                total.failed += summary.failed;
            }
        }
        total
    }

    fn slot(&self, id: SenderId) -> Slot {
        if let Some(slot) = self.slots.get(&id) {
            return slot.value().clone();
        }
        self.slots.entry(id).or_default().value().clone()
    }

    fn occupied(&self) -> Vec<Arc<DataSender>> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.iter().filter_map(|slot| slot.lock().clone()).collect()
    }
}
