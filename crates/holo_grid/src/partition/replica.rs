//! Single-task executor owning one replica of one partition.
//!
//! Every command against a replica (operations, backup application, merge
//! application, reads) is processed by one tokio task in arrival order, so
//! nothing inside `PartitionState` needs locking. After an operation runs the
//! executor replies to the caller, wakes waiters on the notified key, then
//! replicates: synchronous backups are awaited before the next command is
//! taken, asynchronous ones are tracked and reaped in the background.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::collection::Record;
use crate::event::EventPublisher;
use crate::merge::{apply_merge, AppliedMerge, MergeReport, MergeRequest};
use crate::notify::WaitNotifyService;
use crate::operation::{
    execute_operation, BackupOperation, KeyTarget, Operation, OperationContext, Response,
    TxnLockAndGetOperation,
};
use crate::types::{PartitionId, ReplicaId};

use super::state::PartitionState;
use super::transport::BackupTransport;

/// Collaborators a replica executor is wired to.
#[derive(Clone)]
pub struct ReplicaOptions {
    pub replica_id: ReplicaId,
    pub events: Arc<dyn EventPublisher>,
    pub transport: Arc<dyn BackupTransport>,
    pub notifier: Arc<WaitNotifyService>,
}

type ReadFn = Box<dyn FnOnce(&PartitionState) + Send>;

enum PartitionCommand {
    Execute {
        op: Box<dyn Operation>,
        reply: oneshot::Sender<anyhow::Result<Response>>,
    },
    ApplyBackup {
        op: BackupOperation,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    Read(ReadFn),
    Merge {
        request: MergeRequest,
        reply: oneshot::Sender<anyhow::Result<MergeReport>>,
    },
    SetBackups(Vec<ReplicaId>),
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Counters kept by a replica executor.
#[derive(Debug, Default)]
pub struct PartitionMetrics {
    ops_executed: AtomicU64,
    ops_failed: AtomicU64,
    backups_sent: AtomicU64,
    backup_failures: AtomicU64,
    backups_applied: AtomicU64,
    merges_applied: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PartitionMetricsSnapshot {
    pub ops_executed: u64,
    pub ops_failed: u64,
    pub backups_sent: u64,
    pub backup_failures: u64,
    pub backups_applied: u64,
    pub merges_applied: u64,
}

impl PartitionMetrics {
    pub fn snapshot(&self) -> PartitionMetricsSnapshot {
        PartitionMetricsSnapshot {
            ops_executed: self.ops_executed.load(Ordering::Relaxed),
            ops_failed: self.ops_failed.load(Ordering::Relaxed),
            backups_sent: self.backups_sent.load(Ordering::Relaxed),
            backup_failures: self.backup_failures.load(Ordering::Relaxed),
            backups_applied: self.backups_applied.load(Ordering::Relaxed),
            merges_applied: self.merges_applied.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable address of a replica executor.
#[derive(Clone)]
pub struct PartitionHandle {
    partition_id: PartitionId,
    replica_id: ReplicaId,
    tx: mpsc::UnboundedSender<PartitionCommand>,
    notifier: Arc<WaitNotifyService>,
    metrics: Arc<PartitionMetrics>,
}

/// Spawn the executor task for one replica holding `state`.
pub fn spawn_replica(options: ReplicaOptions, state: PartitionState) -> PartitionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(PartitionMetrics::default());
    let handle = PartitionHandle {
        partition_id: state.partition_id(),
        replica_id: options.replica_id,
        tx,
        notifier: options.notifier.clone(),
        metrics: metrics.clone(),
    };
    let executor = Executor {
        state,
        backups: Vec::new(),
        options,
        metrics,
        pending: JoinSet::new(),
    };
    tokio::spawn(executor.run(rx));
    handle
}

impl PartitionHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn notifier(&self) -> &Arc<WaitNotifyService> {
        &self.notifier
    }

    pub fn metrics(&self) -> PartitionMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PartitionCommand,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).map_err(|_| {
            anyhow::anyhow!(
                "partition {} replica {} closed",
                self.partition_id,
                self.replica_id
            )
        })?;
        rx.await.context("partition reply dropped")
    }

    /// Run `op` on this replica and return its response.
    pub async fn execute(&self, op: impl Operation) -> anyhow::Result<Response> {
        self.request(|reply| PartitionCommand::Execute {
            op: Box::new(op),
            reply,
        })
        .await?
    }

    pub async fn apply_backup(&self, op: BackupOperation) -> anyhow::Result<()> {
        self.request(|ack| PartitionCommand::ApplyBackup { op, ack })
            .await?
    }

    /// Evaluate `f` against the replica's state in executor order.
    pub async fn read<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PartitionState) -> T + Send + 'static,
    {
        self.request(|tx| {
            PartitionCommand::Read(Box::new(move |state: &PartitionState| {
                let _ = tx.send(f(state));
            }))
        })
        .await
    }

    pub async fn merge(&self, request: MergeRequest) -> anyhow::Result<MergeReport> {
        self.request(|reply| PartitionCommand::Merge { request, reply })
            .await?
    }

    /// Replace the ordered backup replica list (sync first, then async).
    pub fn set_backups(&self, backups: Vec<ReplicaId>) -> anyhow::Result<()> {
        self.tx
            .send(PartitionCommand::SetBackups(backups))
            .map_err(|_| anyhow::anyhow!("partition {} replica closed", self.partition_id))
    }

    /// Resolve once every command queued before it, including in-flight
    /// asynchronous backups, has completed.
    pub async fn barrier(&self) -> anyhow::Result<()> {
        self.request(PartitionCommand::Barrier).await
    }

    /// Stop the executor after draining queued work. Stopping an already
    /// stopped replica succeeds.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.request(PartitionCommand::Shutdown).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_closed() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn fork_state(&self) -> anyhow::Result<PartitionState> {
        self.read(PartitionState::fork).await
    }

    /// Reserve `target.key` for the target's caller/thread, waiting up to
    /// `timeout` for a competing reservation to go away. `Ok(None)` on timeout.
    pub async fn lock_and_get(
        &self,
        target: KeyTarget,
        timeout: Duration,
    ) -> anyhow::Result<Option<Vec<Record>>> {
        let wait_key = target.wait_key();
        self.notifier
            .wait_for(&wait_key, timeout, || self.try_lock_and_get(target.clone()))
            .await
    }

    async fn try_lock_and_get(&self, target: KeyTarget) -> anyhow::Result<Option<Vec<Record>>> {
        match self.execute(TxnLockAndGetOperation::new(target)).await? {
            Response::Records(records) => Ok(Some(records)),
            Response::Bool(false) => Ok(None),
            other => anyhow::bail!("unexpected lock-and-get response {other:?}"),
        }
    }
}

struct Executor {
    state: PartitionState,
    backups: Vec<ReplicaId>,
    options: ReplicaOptions,
    metrics: Arc<PartitionMetrics>,
    pending: JoinSet<()>,
}

impl Executor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PartitionCommand>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(PartitionCommand::Shutdown(done)) => {
                            self.drain_pending().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(cmd) => self.handle(cmd).await,
                        None => {
                            self.drain_pending().await;
                            break;
                        }
                    }
                }
                Some(joined) = self.pending.join_next(), if !self.pending.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!(error = ?err, "async backup task failed");
                    }
                }
            }
        }
        tracing::debug!(
            partition_id = self.state.partition_id(),
            replica_id = self.options.replica_id,
            "partition replica stopped"
        );
    }

    async fn handle(&mut self, cmd: PartitionCommand) {
        match cmd {
            PartitionCommand::Execute { mut op, reply } => {
                let name = op.name();
                let result = {
                    let mut ctx = OperationContext {
                        state: &mut self.state,
                        events: self.options.events.as_ref(),
                    };
                    execute_operation(op.as_mut(), &mut ctx)
                };
                match result {
                    Ok(outcome) => {
                        self.metrics.ops_executed.fetch_add(1, Ordering::Relaxed);
                        let _ = reply.send(Ok(outcome.response));
                        if let Some(key) = outcome.notified_key {
                            self.options.notifier.notify(&key);
                        }
                        if let Some(backup) = outcome.backup {
                            self.replicate(backup).await;
                        }
                    }
                    Err(err) => {
                        self.metrics.ops_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = ?err,
                            operation = name,
                            partition_id = self.state.partition_id(),
                            "operation failed"
                        );
                        let _ = reply.send(Err(err));
                    }
                }
            }
            PartitionCommand::ApplyBackup { op, ack } => {
                let result = op.apply(&mut self.state);
                match &result {
                    Ok(()) => {
                        self.metrics.backups_applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = ?err,
                            partition_id = self.state.partition_id(),
                            structure = %op.structure,
                            "backup apply failed"
                        );
                    }
                }
                let _ = ack.send(result);
            }
            PartitionCommand::Read(f) => f(&self.state),
            PartitionCommand::Merge { request, reply } => {
                match apply_merge(&mut self.state, request, self.options.events.as_ref()) {
                    Ok(AppliedMerge {
                        report,
                        backups,
                        notified,
                    }) => {
                        self.metrics.merges_applied.fetch_add(1, Ordering::Relaxed);
                        let _ = reply.send(Ok(report));
                        for key in &notified {
                            self.options.notifier.notify(key);
                        }
                        for backup in backups {
                            self.replicate(backup).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = ?err,
                            partition_id = self.state.partition_id(),
                            "merge apply failed"
                        );
                        let _ = reply.send(Err(err));
                    }
                }
            }
            PartitionCommand::SetBackups(backups) => {
                self.backups = backups;
            }
            PartitionCommand::Barrier(done) => {
                self.drain_pending().await;
                let _ = done.send(());
            }
            PartitionCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn replicate(&mut self, op: BackupOperation) {
        let config = self.state.config().structure(&op.structure);
        let sync_count = config.backup_count.min(self.backups.len());
        let async_count = config
            .async_backup_count
            .min(self.backups.len() - sync_count);
        let partition_id = self.state.partition_id();

        let mut sync_sends: FuturesUnordered<_> = self.backups[..sync_count]
            .iter()
            .map(|&target| {
                let transport = self.options.transport.clone();
                let op = op.clone();
                async move { (target, transport.send_backup(target, op).await) }
            })
            .collect();
        while let Some((target, result)) = sync_sends.next().await {
            record_backup(&self.metrics, partition_id, target, result);
        }

        for &target in &self.backups[sync_count..sync_count + async_count] {
            let transport = self.options.transport.clone();
            let metrics = self.metrics.clone();
            let op = op.clone();
            self.pending.spawn(async move {
                let result = transport.send_backup(target, op).await;
                record_backup(&metrics, partition_id, target, result);
            });
        }
    }

    async fn drain_pending(&mut self) {
        while let Some(joined) = self.pending.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = ?err, "async backup task failed");
            }
        }
    }
}

fn record_backup(
    metrics: &PartitionMetrics,
    partition_id: PartitionId,
    target: ReplicaId,
    result: anyhow::Result<()>,
) {
    metrics.backups_sent.fetch_add(1, Ordering::Relaxed);
    if let Err(err) = result {
        metrics.backup_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            error = ?err,
            partition_id,
            replica_id = target,
            "backup delivery failed; replica stays behind until the next resync"
        );
    }
}
