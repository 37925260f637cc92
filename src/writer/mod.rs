// Delivery side of the sender: the transport seam and its in-memory implementation
pub mod memory;

use crate::Result;
use crate::record::BatchRecord;

pub use memory::MemoryTransport;

/// Delivers one assembled batch to the index service.
///
/// `send` blocks until the service accepted the batch or the attempt failed.
/// The pending rows are only cleared after `Ok(())`.
pub trait Transport: Send + Sync {
    fn send(&self, record: &BatchRecord) -> Result<()>;
}
