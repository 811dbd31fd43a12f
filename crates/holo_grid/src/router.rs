//! Key to partition routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use crate::partition::PartitionHandle;
use crate::types::PartitionId;

pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Resolves partitions to the replica currently owning them.
pub trait PartitionRouter: Send + Sync + 'static {
    fn partition_count(&self) -> u32;

    fn owner(&self, partition_id: PartitionId) -> anyhow::Result<PartitionHandle>;

    fn partition_for_key(&self, key: &[u8]) -> PartitionId {
        let count = u64::from(self.partition_count().max(1));
        (hash_key(key) % count) as PartitionId
    }

    fn owner_for_key(&self, key: &[u8]) -> anyhow::Result<PartitionHandle> {
        self.owner(self.partition_for_key(key))
    }
}

/// Primary and ordered backup replicas of every partition.
#[derive(Clone)]
pub struct RouteTable {
    pub primaries: Vec<PartitionHandle>,
    pub backups: Vec<Vec<PartitionHandle>>,
}

/// Router over a route table that can be swapped wholesale, e.g. when a
/// healed brain adopts the surviving side's ownership.
pub struct StaticRouter {
    table: RwLock<Arc<RouteTable>>,
}

impl StaticRouter {
    pub fn new(table: RouteTable) -> anyhow::Result<Self> {
        validate(&table)?;
        Ok(Self {
            table: RwLock::new(Arc::new(table)),
        })
    }

    pub fn table(&self) -> Arc<RouteTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Swap in a new table. The partition count must not change.
    pub fn replace(&self, table: RouteTable) -> anyhow::Result<()> {
        validate(&table)?;
        let mut current = self.table.write().unwrap_or_else(|p| p.into_inner());
        anyhow::ensure!(
            current.primaries.len() == table.primaries.len(),
            "route table has {} partitions, expected {}",
            table.primaries.len(),
            current.primaries.len()
        );
        *current = Arc::new(table);
        Ok(())
    }

    pub fn backups(&self, partition_id: PartitionId) -> Vec<PartitionHandle> {
        self.table()
            .backups
            .get(partition_id as usize)
            .cloned()
            .unwrap_or_default()
    }
}

fn validate(table: &RouteTable) -> anyhow::Result<()> {
    anyhow::ensure!(!table.primaries.is_empty(), "route table has no partitions");
    anyhow::ensure!(
        table.backups.len() == table.primaries.len(),
        "route table lists backups for {} partitions but has {} primaries",
        table.backups.len(),
        table.primaries.len()
    );
    for (idx, primary) in table.primaries.iter().enumerate() {
        anyhow::ensure!(
            primary.partition_id() as usize == idx,
            "primary at slot {idx} owns partition {}",
            primary.partition_id()
        );
    }
    Ok(())
}

impl PartitionRouter for StaticRouter {
    fn partition_count(&self) -> u32 {
        self.table().primaries.len() as u32
    }

    fn owner(&self, partition_id: PartitionId) -> anyhow::Result<PartitionHandle> {
        self.table()
            .primaries
            .get(partition_id as usize)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no owner for partition {partition_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_is_stable() {
        assert_eq!(hash_key(b"key1"), hash_key(b"key1"));
        assert_ne!(hash_key(b"key1"), hash_key(b"key2"));
    }
}
