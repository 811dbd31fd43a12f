mod common;

use std::sync::Arc;

use async_trait::async_trait;
use holo_grid::event::NoopEventPublisher;
use holo_grid::notify::WaitNotifyService;
use holo_grid::operation::{BackupOperation, CachePutOperation, KeyTarget, Response, TxnRemoveAllOperation};
use holo_grid::partition::{spawn_replica, BackupTransport, PartitionState, ReplicaOptions};
use holo_grid::router::PartitionRouter;
use holo_grid::{GridConfig, InMemoryFormat, LocalGrid, ReplicaId};
use serde_json::json;

struct UnreachableTransport;

#[async_trait]
impl BackupTransport for UnreachableTransport {
    async fn send_backup(&self, target: ReplicaId, _op: BackupOperation) -> anyhow::Result<()> {
        anyhow::bail!("replica {target} unreachable")
    }
}

async fn locked_on_backup(grid: &LocalGrid, multimap: &'static str, key: &'static [u8]) -> anyhow::Result<bool> {
    let partition_id = grid.partition_for_key(key);
    grid.backup_read(partition_id, 0, move |state| {
        state.container(multimap).is_some_and(|c| c.is_locked(key))
    })
    .await
}

#[tokio::test]
async fn failed_backup_leaves_the_primary_change_in_place() -> anyhow::Result<()> {
    let config = Arc::new(common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let primary = spawn_replica(
        ReplicaOptions {
            replica_id: 1,
            events: Arc::new(NoopEventPublisher),
            transport: Arc::new(UnreachableTransport),
            notifier: Arc::new(WaitNotifyService::default()),
        },
        PartitionState::new(0, config),
    );
    primary.set_backups(vec![2])?;

    let response = primary
        .execute(CachePutOperation::new("cache", b"k", json!("v")))
        .await?;
    assert_eq!(response, Response::Value(None));
    primary.barrier().await?;

    let size = primary
        .read(|state| state.cache("cache").map_or(0, |store| store.size()))
        .await?;
    assert_eq!(size, 1);
    let metrics = primary.metrics();
    assert_eq!(metrics.ops_executed, 1);
    assert_eq!(metrics.backups_sent, 1);
    assert_eq!(metrics.backup_failures, 1);

    primary.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_backups_are_applied_by_the_next_barrier() -> anyhow::Result<()> {
    let config = GridConfig::default().with_defaults(
        common::structure("put-if-absent", InMemoryFormat::Object)
            .with_backup_count(0)
            .with_async_backup_count(2),
    );
    let grid = common::start_grid("grid", config);
    assert_eq!(grid.backups_per_partition(), 2);

    let cache = grid.cache("cache");
    for i in 0..16 {
        cache.put(format!("key-{i}"), json!(i)).await?;
    }
    cache.remove("key-3").await?;

    let backup = common::backup_cache(&grid, "cache").await;
    assert_eq!(backup.len(), 15);
    assert_eq!(backup.get("key-7"), Some(&json!(7)));
    assert!(!backup.contains_key("key-3"));

    let second_backup_size: usize = {
        let mut total = 0;
        for partition_id in 0..grid.partition_count() {
            total += grid
                .backup_read(partition_id, 1, |state| {
                    state.cache("cache").map_or(0, |store| store.size())
                })
                .await?;
        }
        total
    };
    assert_eq!(second_backup_size, 15);

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backups_mirror_lock_state_of_reservations() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let mut txn = grid.transaction("mm", common::LOCK_TIMEOUT);
    txn.get("k").await?;
    grid.barrier().await?;

    assert!(locked_on_backup(&grid, "mm", b"k").await?);

    txn.rollback().await?;
    grid.barrier().await?;
    assert!(!locked_on_backup(&grid, "mm", b"k").await?);

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_all_that_removes_nothing_still_unlocks_backups() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let owner = grid.router().owner_for_key(b"k")?;

    // Stale ids: the precondition fails but the reservation is released.
    let target = KeyTarget::new("mm", b"k", grid.next_caller_id(), 1);
    assert!(owner.lock_and_get(target.clone(), common::LOCK_TIMEOUT).await?.is_some());
    grid.barrier().await?;
    assert!(locked_on_backup(&grid, "mm", b"k").await?);
    let response = owner
        .execute(TxnRemoveAllOperation::new(target, vec![999]))
        .await?;
    assert_eq!(response, Response::Bool(false));
    grid.barrier().await?;
    assert!(!grid.multimap("mm").is_locked("k").await?);
    assert!(!locked_on_backup(&grid, "mm", b"k").await?);

    // Nothing staged for removal: succeeds and releases the reservation.
    let target = KeyTarget::new("mm", b"k", grid.next_caller_id(), 1);
    assert!(owner.lock_and_get(target.clone(), common::LOCK_TIMEOUT).await?.is_some());
    let response = owner
        .execute(TxnRemoveAllOperation::new(target, Vec::new()))
        .await?;
    assert_eq!(response, Response::Bool(true));
    grid.barrier().await?;
    assert!(!locked_on_backup(&grid, "mm", b"k").await?);

    grid.shutdown().await
}
