mod common;

use holo_grid::transaction::KeyConflict;
use holo_grid::InMemoryFormat;
use serde_json::json;

const MULTIMAP: &str = "carts";

async fn diverge(policy: &str) -> (holo_grid::LocalGrid, Vec<holo_grid::merge::MergeReport>) {
    let config = common::grid_config(policy, InMemoryFormat::Binary);
    let first = common::start_grid("first", config.clone());
    let second = common::split(&first, "second").await;

    let mut txn = first.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k1", json!("a")).await.expect("put");
    txn.commit().await.expect("commit");

    let mut txn = second.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k1", json!("b")).await.expect("put");
    txn.put("k1", json!("c")).await.expect("put");
    txn.put("k2", json!("d")).await.expect("put");
    txn.commit().await.expect("commit");

    let reports = second
        .heal_into(&first, &common::merger(&config))
        .await
        .expect("heal");
    (first, reports)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_if_absent_only_adds_keys_missing_on_the_survivor() {
    let (grid, reports) = diverge("put-if-absent").await;
    let multimap = grid.multimap(MULTIMAP);

    assert_eq!(multimap.get("k1").await.expect("get"), vec![json!("a")]);
    assert_eq!(multimap.get("k2").await.expect("get"), vec![json!("d")]);
    assert_eq!(common::backup_values(&grid, MULTIMAP, "k1").await, vec![json!("a")]);
    assert_eq!(common::backup_values(&grid, MULTIMAP, "k2").await, vec![json!("d")]);
    let accepted: usize = reports.iter().map(|r| r.accepted).sum();
    assert_eq!(accepted, 1);

    grid.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pass_through_replaces_whole_collections() {
    let (grid, _) = diverge("pass-through").await;
    let multimap = grid.multimap(MULTIMAP);

    assert_eq!(multimap.get("k1").await.expect("get"), vec![json!("b"), json!("c")]);
    assert_eq!(multimap.get("k2").await.expect("get"), vec![json!("d")]);
    assert_eq!(multimap.size().await.expect("size"), 3);
    assert_eq!(
        common::backup_values(&grid, MULTIMAP, "k1").await,
        vec![json!("b"), json!("c")]
    );

    // Merged records got ids from the survivor, so later transactions see them.
    let mut txn = grid.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    assert!(txn.remove("k1", &json!("b")).await.expect("remove"));
    txn.put("k1", json!("e")).await.expect("put");
    assert!(txn.commit().await.expect("commit").is_clean());
    assert_eq!(multimap.get("k1").await.expect("get"), vec![json!("c"), json!("e")]);

    grid.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merge_under_a_reservation_reports_the_puts_it_kept() {
    let config = common::grid_config("pass-through", InMemoryFormat::Binary);
    let first = common::start_grid("first", config.clone());
    let mut seed = first.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    seed.put("k1", json!("a")).await.expect("put");
    assert!(seed.commit().await.expect("commit").is_clean());

    let second = common::split(&first, "second").await;
    let mut txn = second.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    txn.put("k1", json!("b")).await.expect("put");
    txn.commit().await.expect("commit");

    let mut txn = first.transaction(MULTIMAP, common::LOCK_TIMEOUT);
    assert!(txn.remove("k1", &json!("a")).await.expect("remove"));
    txn.put("k1", json!("x")).await.expect("put");

    // The merged collection gets fresh record ids under the held reservation.
    second
        .heal_into(&first, &common::merger(&config))
        .await
        .expect("heal");

    let outcome = txn.commit().await.expect("commit");
    assert_eq!(outcome.committed_keys, 0);
    assert_eq!(
        outcome.conflicted_keys,
        vec![KeyConflict { key: b"k1".to_vec(), applied_puts: 1 }]
    );
    assert!(!outcome.is_clean());

    let multimap = first.multimap(MULTIMAP);
    assert_eq!(
        multimap.get("k1").await.expect("get"),
        vec![json!("a"), json!("b"), json!("x")]
    );
    assert!(!multimap.is_locked("k1").await.expect("is_locked"));
    assert_eq!(
        common::backup_values(&first, MULTIMAP, "k1").await,
        vec![json!("a"), json!("b"), json!("x")]
    );

    first.shutdown().await.expect("shutdown");
}
