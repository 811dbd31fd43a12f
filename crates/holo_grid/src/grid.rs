//! In-process grid: every partition as a primary plus backup replicas, each
//! on its own executor task, wired through a local backup transport.
//!
//! A grid can be forked to simulate a split brain (each side then evolves
//! independently) and healed by merging one side into the other and pointing
//! the merged side at the survivor's replicas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GridConfig;
use crate::event::EventPublisher;
use crate::merge::{MergeReport, SplitBrainMerger};
use crate::notify::WaitNotifyService;
use crate::partition::{
    spawn_replica, LocalBackupTransport, PartitionHandle, PartitionMetricsSnapshot, PartitionState,
    ReplicaOptions,
};
use crate::proxy::{CacheProxy, MultiMapProxy};
use crate::router::{hash_key, PartitionRouter, RouteTable, StaticRouter};
use crate::transaction::MultiMapTransaction;
use crate::types::{CallerId, PartitionId, ReplicaId};

pub struct LocalGrid {
    label: String,
    config: Arc<GridConfig>,
    router: Arc<StaticRouter>,
    transport: Arc<LocalBackupTransport>,
    owned: Vec<PartitionHandle>,
    next_caller_id: AtomicU64,
}

impl LocalGrid {
    /// Start `partition_count` partitions, each with one primary and as many
    /// backups as the most demanding structure needs.
    pub fn start(
        label: &str,
        config: GridConfig,
        partition_count: u32,
        events: Arc<dyn EventPublisher>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(partition_count > 0, "grid needs at least one partition");
        let config = Arc::new(config);
        let replicas = 1 + config.max_backups();
        let states = (0..partition_count)
            .map(|pid| {
                (0..replicas)
                    .map(|_| PartitionState::new(pid, config.clone()))
                    .collect()
            })
            .collect();
        Self::assemble(label, config, states, events)
    }

    fn assemble(
        label: &str,
        config: Arc<GridConfig>,
        states: Vec<Vec<PartitionState>>,
        events: Arc<dyn EventPublisher>,
    ) -> anyhow::Result<Self> {
        let transport = Arc::new(LocalBackupTransport::new());
        let notifier = Arc::new(WaitNotifyService::default());
        let mut primaries = Vec::with_capacity(states.len());
        let mut backups = Vec::with_capacity(states.len());
        let mut owned = Vec::new();
        let mut next_replica_id: ReplicaId = 1;

        for replica_states in states {
            let mut handles = Vec::with_capacity(replica_states.len());
            for state in replica_states {
                let replica_id = next_replica_id;
                next_replica_id += 1;
                let handle = spawn_replica(
                    ReplicaOptions {
                        replica_id,
                        events: events.clone(),
                        transport: transport.clone(),
                        notifier: notifier.clone(),
                    },
                    state,
                );
                transport.register(replica_id, handle.clone());
                owned.push(handle.clone());
                handles.push(handle);
            }
            let mut handles = handles.into_iter();
            let primary = handles
                .next()
                .ok_or_else(|| anyhow::anyhow!("partition without replicas"))?;
            let partition_backups: Vec<PartitionHandle> = handles.collect();
            primary.set_backups(partition_backups.iter().map(PartitionHandle::replica_id).collect())?;
            primaries.push(primary);
            backups.push(partition_backups);
        }

        let router = Arc::new(StaticRouter::new(RouteTable { primaries, backups })?);
        tracing::info!(
            grid = label,
            partitions = router.partition_count(),
            replicas = owned.len(),
            "grid started"
        );
        Ok(Self {
            label: label.to_string(),
            config,
            router,
            transport,
            owned,
            next_caller_id: AtomicU64::new(hash_key(label.as_bytes()) & 0xffff_ffff_0000_0000),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &Arc<GridConfig> {
        &self.config
    }

    pub fn router(&self) -> Arc<dyn PartitionRouter> {
        self.router.clone()
    }

    pub fn partition_count(&self) -> u32 {
        self.router.partition_count()
    }

    pub fn partition_for_key(&self, key: &[u8]) -> PartitionId {
        self.router.partition_for_key(key)
    }

    pub fn backups_per_partition(&self) -> usize {
        self.router.table().backups.first().map_or(0, Vec::len)
    }

    pub fn cache(&self, name: &str) -> CacheProxy {
        CacheProxy::new(name, self.router())
    }

    pub fn multimap(&self, name: &str) -> MultiMapProxy {
        MultiMapProxy::new(name, self.router())
    }

    /// Begin a multimap transaction with a fresh caller identity.
    pub fn transaction(&self, structure: &str, lock_timeout: Duration) -> MultiMapTransaction {
        MultiMapTransaction::new(structure, self.next_caller_id(), 1, self.router(), lock_timeout)
    }

    pub fn next_caller_id(&self) -> CallerId {
        self.next_caller_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Split off an independent copy of every replica, as the other side of
    /// a network partition would see it.
    pub async fn fork(&self, label: &str, events: Arc<dyn EventPublisher>) -> anyhow::Result<Self> {
        self.barrier().await?;
        let table = self.router.table();
        let mut states = Vec::with_capacity(table.primaries.len());
        for (primary, backups) in table.primaries.iter().zip(&table.backups) {
            let mut replica_states = vec![primary.fork_state().await?];
            for backup in backups {
                replica_states.push(backup.fork_state().await?);
            }
            states.push(replica_states);
        }
        tracing::info!(from = %self.label, to = label, "grid forked");
        Self::assemble(label, self.config.clone(), states, events)
    }

    /// Merge every partition of `other` into this grid's partitions using
    /// each structure's configured merge policy.
    pub async fn merge_from(&self, other: &LocalGrid, merger: &SplitBrainMerger) -> anyhow::Result<Vec<MergeReport>> {
        anyhow::ensure!(
            other.partition_count() == self.partition_count(),
            "cannot merge {} partitions into {}",
            other.partition_count(),
            self.partition_count()
        );
        other.barrier().await?;
        self.barrier().await?;
        let pairs = other
            .router
            .table()
            .primaries
            .iter()
            .cloned()
            .zip(self.router.table().primaries.iter().cloned())
            .collect();
        let reports = merger.merge_all(pairs).await?;
        self.barrier().await?;
        tracing::info!(
            into = %self.label,
            from = %other.label,
            structures = reports.len(),
            "split brain merged"
        );
        Ok(reports)
    }

    /// Route this grid's clients to `destination`'s replicas and stop our own.
    pub async fn join(&self, destination: &LocalGrid) -> anyhow::Result<()> {
        let table = destination.router.table();
        self.router.replace(RouteTable::clone(&table))?;
        for handle in &self.owned {
            self.transport.unregister(handle.replica_id());
            handle.shutdown().await?;
        }
        tracing::info!(grid = %self.label, joined = %destination.label, "grid joined");
        Ok(())
    }

    /// Heal a split: merge this side into `destination`, then join it.
    pub async fn heal_into(&self, destination: &LocalGrid, merger: &SplitBrainMerger) -> anyhow::Result<Vec<MergeReport>> {
        let reports = destination.merge_from(self, merger).await?;
        self.join(destination).await?;
        Ok(reports)
    }

    /// Wait until all queued work, backups included, has been applied on
    /// every replica this grid routes to.
    pub async fn barrier(&self) -> anyhow::Result<()> {
        let table = self.router.table();
        for primary in &table.primaries {
            primary.barrier().await?;
        }
        for backup in table.backups.iter().flatten() {
            backup.barrier().await?;
        }
        Ok(())
    }

    /// Evaluate `f` on the `index`-th backup of `partition_id`.
    pub async fn backup_read<T, F>(&self, partition_id: PartitionId, index: usize, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PartitionState) -> T + Send + 'static,
    {
        let backup = self
            .router
            .backups(partition_id)
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("partition {partition_id} has no backup #{index}"))?;
        backup.read(f).await
    }

    pub fn metrics(&self) -> Vec<(ReplicaId, PartitionMetricsSnapshot)> {
        self.owned
            .iter()
            .map(|handle| (handle.replica_id(), handle.metrics()))
            .collect()
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for handle in &self.owned {
            self.transport.unregister(handle.replica_id());
            handle.shutdown().await?;
        }
        Ok(())
    }
}
