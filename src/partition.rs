//! Partition routing and partition-count discovery.

use xxhash_rust::xxh3::xxh3_64;

use crate::{IndexSenderError, Result};

/// Maps a primary value to a partition number.
///
/// Implementations must be deterministic: the same value and count always
/// yield the same partition, so add/update/delete of one row share a queue.
pub trait PartitionRouter: Send + Sync {
    fn partition(&self, primary_value: &str, partition_count: u32) -> u32;
}

/// Reports the current partition count of a data source.
///
/// Queried on every write so that repartitioning is picked up promptly.
pub trait PartitionSource: Send + Sync {
    fn partition_count(&self) -> Result<u32>;
}

/// Default router: XXH3-64 of the UTF-8 bytes, modulo the partition count.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl PartitionRouter for HashPartitioner {
    fn partition(&self, primary_value: &str, partition_count: u32) -> u32 {
        if partition_count <= 1 {
            return 0;
        }
        (xxh3_64(primary_value.as_bytes()) % u64::from(partition_count)) as u32
    }
}

/// A partition count that never changes.
#[derive(Debug, Clone, Copy)]
pub struct FixedPartitions(pub u32);

impl PartitionSource for FixedPartitions {
    fn partition_count(&self) -> Result<u32> {
        Ok(self.0)
    }
}

/// Ask `source` for the count, rejecting data sources without partitions.
pub(crate) fn checked_partition_count(source: &dyn PartitionSource) -> Result<u32> {
    match source.partition_count()? {
        0 => Err(IndexSenderError::Configuration(
            "data source reports zero partitions".to_string(),
        )),
        count => Ok(count),
    }
}
