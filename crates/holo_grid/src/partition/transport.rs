use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::operation::BackupOperation;
use crate::types::ReplicaId;

use super::replica::PartitionHandle;

/// Delivers backup operations to replicas.
///
/// A returned error is a durability gap the caller logs and counts; it never
/// undoes the primary's mutation.
#[async_trait]
pub trait BackupTransport: Send + Sync + 'static {
    async fn send_backup(&self, target: ReplicaId, op: BackupOperation) -> anyhow::Result<()>;
}

/// In-process transport: looks replicas up by id and applies the backup on
/// the target's executor.
#[derive(Default)]
pub struct LocalBackupTransport {
    replicas: RwLock<HashMap<ReplicaId, PartitionHandle>>,
}

impl LocalBackupTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica_id: ReplicaId, handle: PartitionHandle) {
        let mut replicas = self.replicas.write().unwrap_or_else(|p| p.into_inner());
        replicas.insert(replica_id, handle);
    }

    /// Detach a replica; later backups addressed to it fail as unreachable.
    pub fn unregister(&self, replica_id: ReplicaId) -> Option<PartitionHandle> {
        let mut replicas = self.replicas.write().unwrap_or_else(|p| p.into_inner());
        replicas.remove(&replica_id)
    }

    fn handle(&self, replica_id: ReplicaId) -> Option<PartitionHandle> {
        let replicas = self.replicas.read().unwrap_or_else(|p| p.into_inner());
        replicas.get(&replica_id).cloned()
    }
}

#[async_trait]
impl BackupTransport for LocalBackupTransport {
    async fn send_backup(&self, target: ReplicaId, op: BackupOperation) -> anyhow::Result<()> {
        let handle = self
            .handle(target)
            .ok_or_else(|| anyhow::anyhow!("replica {target} unreachable"))?;
        handle.apply_backup(op).await
    }
}
