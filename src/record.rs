//! Batch records handed to a transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch_key::{Action, BatchKey};

/// One assembled batch: same action, same partition and, for updates, the
/// same column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub action: Action,
    pub data_source: String,
    pub partition: u32,
    /// Column names for update batches, in payload value order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Row payloads in caller order.
    pub payloads: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Assemble the record for `key` from its drained payloads.
    pub fn from_key(data_source: &str, key: &BatchKey, payloads: Vec<String>) -> Self {
        let columns = match key.action() {
            Action::Update => Some(key.column_list()),
            Action::Add | Action::Delete => None,
        };
        Self {
            action: key.action(),
            data_source: data_source.to_string(),
            partition: key.partition(),
            columns,
            payloads,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Give the payloads back, e.g. to re-queue them after a failed send.
    pub fn into_payloads(self) -> Vec<String> {
        self.payloads
    }
}
