//! Partition replicas: owned state, the per-replica executor and the backup
//! transport between replicas.

mod replica;
mod state;
mod transport;

pub use replica::{
    spawn_replica, PartitionHandle, PartitionMetrics, PartitionMetricsSnapshot, ReplicaOptions,
};
pub use state::PartitionState;
pub use transport::{BackupTransport, LocalBackupTransport};
