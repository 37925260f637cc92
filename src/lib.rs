//! # index_sender
//!
//! `index_sender` is the write-path client of a partitioned index service.
//! Callers add, update and delete rows one at a time; the sender groups them
//! per action, partition and update column set, and ships each group as one
//! batch when it fills up or has waited too long.
//!
//! ## Features
//!
//! - Per-partition batching with separate add/delete and update thresholds.
//! - Background flush of queues older than the staleness bound.
//! - Graceful shutdown that sends everything still pending.
//! - NATS request/reply backend for metadata, partition count and delivery.
//! - One shared sender per server and data source through [`SenderRegistry`].
//!
//! ## Usage
//!
//! 1. Create a [`SenderRegistry`] owned by the application.
//! 2. Build a sender with [`DataSender::builder`].
//! 3. Write rows with `add_row`, `add_values`, `update` or `delete`.
//! 4. Close the registry (or the sender) before exiting.
//!
//! ### Example
//!
//! ```no_run
//! use index_sender::{DataSender, SenderRegistry};
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = SenderRegistry::new();
//!     let sender = DataSender::builder()
//!         .to_server("nats://localhost:4222/uindex")
//!         .of_data_source("users")
//!         .add_threshold(100)
//!         .update_threshold(50)
//!         .build(&registry)?;
//!
//!     sender.add_row("1001|Nicolas|male|18")?;
//!     sender.add_values(&[json!("1003"), json!("Ming"), json!("male"), json!(22)])?;
//!     sender.update(json!({"id": "1001", "age": 20}).as_object().unwrap())?;
//!     sender.delete("1002")?;
//!
//!     registry.close_all();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - `sender`: the write operations, builder and shutdown path.
//! - `pending_cache`: per-key row queues and flush decisions.
//! - `scheduler`: the background staleness flush thread.
//! - `nats_connection`: the NATS-backed index service client.

pub mod batch_key;
pub mod config;
pub mod error;
pub mod flusher;
pub mod metadata;
pub mod nats_connection;
pub mod partition;
pub mod pending_cache;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod writer;

#[cfg(test)]
mod sender_test;

pub use batch_key::{Action, BatchKey};
pub use config::SenderConfig;
pub use error::{IndexSenderError, Result};
pub use metadata::{DataSourceMetadata, DataSourceSpec};
pub use partition::{FixedPartitions, HashPartitioner, PartitionRouter, PartitionSource};
pub use pending_cache::DrainSummary;
pub use record::BatchRecord;
pub use registry::SenderRegistry;
pub use sender::{DataSender, IndexBackend, SenderBuilder, SenderStats};
pub use writer::{MemoryTransport, Transport};
