//! Identity of one pending batch queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator used inside an update column signature.
pub const COLUMN_SEPARATOR: &str = ",";

/// Kind of write a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one queue in the pending cache.
///
/// Two keys are equal when action, column signature and partition all match.
/// Flush bookkeeping lives next to the queue, so a key never changes once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    action: Action,
    columns: Option<String>,
    partition: u32,
}

impl BatchKey {
    pub fn add(partition: u32) -> Self {
        Self { action: Action::Add, columns: None, partition }
    }

    pub fn delete(partition: u32) -> Self {
        Self { action: Action::Delete, columns: None, partition }
    }

    /// Update key for an already joined column signature, e.g. `"age,id"`.
    pub fn update(columns: impl Into<String>, partition: u32) -> Self {
        Self {
            action: Action::Update,
            columns: Some(columns.into()),
            partition,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Column signature, only present for update keys.
    pub fn columns(&self) -> Option<&str> {
        self.columns.as_deref()
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Signature split back into column names, whitespace trimmed.
    pub fn column_list(&self) -> Vec<String> {
        self.columns
            .as_deref()
            .map(|c| c.split(COLUMN_SEPARATOR).map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.columns {
            Some(columns) => write!(f, "{}[{}]#{}", self.action, columns, self.partition),
            None => write!(f, "{}#{}", self.action, self.partition),
        }
    }
}
