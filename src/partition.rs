//! Partition functions.
//!
//! A partitioner maps each transaction to one of a fixed number of
//! partitions and says whether the transaction is critical, i.e. must be
//! serialized against every partition. The set of partitioners is closed and
//! chosen by [`PartitionerConfig`].
//!
//! Shard [`UNKNOWN_SHARD`] is critical under every partitioner: with no shard
//! there is no way to know which partitions it could conflict with.

use crate::config::PartitionerConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{ReplicatedEvent, UNKNOWN_SHARD};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Where one transaction goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub partition: usize,
    pub critical: bool,
}

pub trait Partitioner: Send + Sync {
    /// Assign `event`, dispatched by apply task `task_id`.
    fn partition(&self, event: &ReplicatedEvent, task_id: u32) -> PartitionAssignment;

    /// Fixed partition count.
    fn partitions(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// 64-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

fn hash_partition(shard_id: &str, partitions: usize) -> usize {
    (fnv1a(shard_id.as_bytes()) % partitions as u64) as usize
}

/// FNV-1a of the shard id modulo the partition count.
pub struct HashPartitioner {
    partitions: usize,
}

impl HashPartitioner {
    /// A count of 0 is treated as 1.
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, event: &ReplicatedEvent, _task_id: u32) -> PartitionAssignment {
        let shard = event.header.shard_id.as_str();
        PartitionAssignment {
            partition: hash_partition(shard, self.partitions),
            critical: shard == UNKNOWN_SHARD,
        }
    }

    fn partitions(&self) -> usize {
        self.partitions
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// Everything to partition 0.
pub struct SinglePartitioner;

impl Partitioner for SinglePartitioner {
    fn partition(&self, event: &ReplicatedEvent, _task_id: u32) -> PartitionAssignment {
        PartitionAssignment {
            partition: 0,
            critical: event.header.shard_id == UNKNOWN_SHARD,
        }
    }

    fn partitions(&self) -> usize {
        1
    }

    fn name(&self) -> &'static str {
        "single"
    }
}

/// Explicit shard to partition table. Unmapped shards go to the default
/// partition, or are hashed when there is none.
pub struct ShardListPartitioner {
    partitions: usize,
    mapping: HashMap<String, usize>,
    critical: HashSet<String>,
    default_partition: Option<usize>,
}

impl ShardListPartitioner {
    pub fn new(
        partitions: usize,
        mapping: HashMap<String, usize>,
        critical_shards: Vec<String>,
        default_partition: Option<usize>,
    ) -> Result<Self> {
        let out_of_range = mapping
            .values()
            .copied()
            .chain(default_partition)
            .find(|p| *p >= partitions);
        if let Some(partition) = out_of_range {
            return Err(ReplicationError::Config(format!(
                "shard list maps to partition {} but only {} partitions are configured",
                partition, partitions
            )));
        }
        Ok(Self {
            partitions,
            mapping,
            critical: critical_shards.into_iter().collect(),
            default_partition,
        })
    }
}

impl Partitioner for ShardListPartitioner {
    fn partition(&self, event: &ReplicatedEvent, _task_id: u32) -> PartitionAssignment {
        let shard = event.header.shard_id.as_str();
        let partition = match self.mapping.get(shard) {
            Some(partition) => *partition,
            None => self
                .default_partition
                .unwrap_or_else(|| hash_partition(shard, self.partitions)),
        };
        PartitionAssignment {
            partition,
            critical: shard == UNKNOWN_SHARD || self.critical.contains(shard),
        }
    }

    fn partitions(&self) -> usize {
        self.partitions
    }

    fn name(&self) -> &'static str {
        "shard_list"
    }
}

/// Build the configured partitioner.
pub fn build_partitioner(config: &PartitionerConfig, partitions: usize) -> Result<Arc<dyn Partitioner>> {
    if partitions == 0 {
        return Err(ReplicationError::Config("partition count must be at least 1".to_string()));
    }
    Ok(match config {
        PartitionerConfig::Hash => Arc::new(HashPartitioner::new(partitions)),
        PartitionerConfig::Single => Arc::new(SinglePartitioner),
        PartitionerConfig::ShardList {
            mapping,
            critical_shards,
            default_partition,
        } => Arc::new(ShardListPartitioner::new(
            partitions,
            mapping.clone(),
            critical_shards.clone(),
            *default_partition,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Header, Payload};

    fn event(shard: &str) -> ReplicatedEvent {
        let mut header = Header::new(1, "src", 0);
        header.shard_id = shard.to_string();
        ReplicatedEvent::new(header, Payload::Empty)
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_hash_is_stable_and_in_range() {
        let p = HashPartitioner::new(4);
        for shard in ["sales", "hr", "inventory", "a", "b"] {
            let first = p.partition(&event(shard), 0);
            assert!(first.partition < 4);
            assert!(!first.critical);
            assert_eq!(p.partition(&event(shard), 1), first);
        }
    }

    #[test]
    fn test_hash_zero_partitions_clamped() {
        let p = HashPartitioner::new(0);
        assert_eq!(p.partitions(), 1);
        assert_eq!(p.partition(&event("orders"), 0).partition, 0);
    }

    #[test]
    fn test_unknown_shard_is_critical_everywhere() {
        let shard_list = ShardListPartitioner::new(2, HashMap::new(), vec![], None).unwrap();
        let partitioners: Vec<Box<dyn Partitioner>> = vec![
            Box::new(HashPartitioner::new(3)),
            Box::new(SinglePartitioner),
            Box::new(shard_list),
        ];
        for p in &partitioners {
            assert!(p.partition(&event(UNKNOWN_SHARD), 0).critical, "{}", p.name());
        }
    }

    #[test]
    fn test_shard_list_mapping_and_critical() {
        let mapping = HashMap::from([("sales".to_string(), 1), ("hr".to_string(), 0)]);
        let p = ShardListPartitioner::new(2, mapping, vec!["ddl".to_string()], Some(0)).unwrap();

        assert_eq!(
            p.partition(&event("sales"), 0),
            PartitionAssignment {
                partition: 1,
                critical: false
            }
        );
        assert_eq!(p.partition(&event("unmapped"), 0).partition, 0);
        assert!(p.partition(&event("ddl"), 0).critical);
    }

    #[test]
    fn test_shard_list_rejects_out_of_range() {
        let mapping = HashMap::from([("sales".to_string(), 5)]);
        assert!(ShardListPartitioner::new(2, mapping, vec![], None).is_err());
        assert!(ShardListPartitioner::new(2, HashMap::new(), vec![], Some(2)).is_err());
    }

    #[test]
    fn test_build_from_config() {
        assert_eq!(build_partitioner(&PartitionerConfig::Hash, 4).unwrap().name(), "hash");
        assert_eq!(build_partitioner(&PartitionerConfig::Single, 4).unwrap().partitions(), 1);
        assert!(build_partitioner(&PartitionerConfig::Hash, 0).is_err());
    }
}
