mod common;

use std::time::Duration;

use holo_grid::config::ValueCollectionType;
use holo_grid::router::PartitionRouter;
use holo_grid::{GridConfig, InMemoryFormat};
use serde_json::json;

const MULTIMAP: &str = "sessions";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_publishes_staged_puts_and_removals() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let multimap = grid.multimap(MULTIMAP);

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k1", json!(1)).await?;
    txn.put("k1", json!(2)).await?;
    txn.put("k2", json!("x")).await?;
    assert_eq!(txn.get("k1").await?, vec![json!(1), json!(2)]);
    // Staged changes stay invisible and the keys stay reserved until commit.
    assert!(multimap.get("k1").await?.is_empty());
    assert!(multimap.is_locked("k1").await?);
    let outcome = txn.commit().await?;
    assert!(outcome.is_clean());
    assert_eq!(outcome.committed_keys, 2);

    assert_eq!(multimap.get("k1").await?, vec![json!(1), json!(2)]);
    assert_eq!(multimap.size().await?, 3);
    assert!(!multimap.is_locked("k1").await?);
    assert_eq!(common::backup_values(&grid, MULTIMAP, "k1").await, vec![json!(1), json!(2)]);

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    assert!(txn.remove("k1", &json!(1)).await?);
    assert!(!txn.remove("k1", &json!(42)).await?);
    assert_eq!(txn.remove_all("k2").await?, vec![json!("x")]);
    assert!(txn.commit().await?.is_clean());

    assert_eq!(multimap.get("k1").await?, vec![json!(2)]);
    assert!(multimap.get("k2").await?.is_empty());
    assert_eq!(multimap.value_count("k2").await?, 0);
    assert_eq!(common::backup_values(&grid, MULTIMAP, "k1").await, vec![json!(2)]);
    assert!(common::backup_values(&grid, MULTIMAP, "k2").await.is_empty());

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_discards_staged_changes_and_releases_keys() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let multimap = grid.multimap(MULTIMAP);

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k", json!("kept")).await?;
    txn.commit().await?;

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.remove_all("k").await?;
    txn.put("k", json!("discarded")).await?;
    txn.rollback().await?;

    assert_eq!(multimap.get("k").await?, vec![json!("kept")]);
    assert!(!multimap.is_locked("k").await?);

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn competing_reservation_times_out() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));

    let mut holder = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    holder.get("k").await?;

    let mut impatient = grid.transaction(MULTIMAP, Duration::from_millis(120));
    let err = impatient.get("k").await.expect_err("key is reserved");
    assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
    impatient.rollback().await?;

    holder.rollback().await?;
    let mut next = grid.transaction(MULTIMAP, Duration::from_millis(120));
    assert!(next.get("k").await?.is_empty());
    next.rollback().await?;

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_collections_reject_duplicate_values_at_commit() -> anyhow::Result<()> {
    let config = GridConfig::default().with_defaults(
        common::structure("put-if-absent", InMemoryFormat::Binary)
            .with_value_collection_type(ValueCollectionType::Set),
    );
    let grid = common::start_grid("grid", config);

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k", json!("v")).await?;
    txn.put("k", json!("v")).await?;
    let outcome = txn.commit().await?;
    assert_eq!(outcome.rejected_puts, 1);
    assert!(!outcome.is_clean());
    assert_eq!(grid.multimap(MULTIMAP).get("k").await?, vec![json!("v")]);

    grid.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_owner_does_not_strand_other_reservations() -> anyhow::Result<()> {
    let grid = common::start_grid("grid", common::grid_config("put-if-absent", InMemoryFormat::Binary));
    let multimap = grid.multimap(MULTIMAP);

    // Keys commit in byte order, so the failing key comes first.
    let lost = "a-lost";
    let kept = (0..64)
        .map(|i| format!("b-{i}"))
        .find(|key| grid.partition_for_key(key.as_bytes()) != grid.partition_for_key(lost.as_bytes()))
        .expect("a key on another partition");

    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put(lost, json!("never")).await?;
    txn.put(&kept, json!("kept")).await?;
    assert!(multimap.is_locked(&kept).await?);

    grid.router()
        .owner(grid.partition_for_key(lost.as_bytes()))?
        .shutdown()
        .await?;

    let outcome = txn.commit().await?;
    assert_eq!(outcome.failed_keys, vec![lost.as_bytes().to_vec()]);
    assert_eq!(outcome.committed_keys, 1);
    assert!(!outcome.is_clean());

    assert_eq!(multimap.get(&kept).await?, vec![json!("kept")]);
    assert!(!multimap.is_locked(&kept).await?);
    let mut next = grid.transaction(MULTIMAP, Duration::from_millis(120));
    assert_eq!(next.get(&kept).await?, vec![json!("kept")]);
    next.rollback().await?;

    grid.shutdown().await
}
