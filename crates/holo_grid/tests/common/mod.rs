//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use holo_grid::event::{ChannelEventPublisher, EntryEvent, NoopEventPublisher};
use holo_grid::merge::{MergePolicyRegistry, SplitBrainMerger};
use holo_grid::{GridConfig, InMemoryFormat, LocalGrid, StoredValue, StructureConfig};
use tokio::sync::mpsc;

/// Partitions per test grid; enough that keys spread over several owners.
pub const PARTITIONS: u32 = 4;
/// Upper bound for transactional key reservations in tests.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a test waits for something that should happen promptly.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One synchronous backup, no async backups, statistics on.
pub fn structure(policy: &str, format: InMemoryFormat) -> StructureConfig {
    StructureConfig::default()
        .with_backup_count(1)
        .with_async_backup_count(0)
        .with_in_memory_format(format)
        .with_statistics_enabled(true)
        .with_merge_policy(policy)
}

pub fn grid_config(policy: &str, format: InMemoryFormat) -> GridConfig {
    GridConfig::default().with_defaults(structure(policy, format))
}

pub fn start_grid(label: &str, config: GridConfig) -> LocalGrid {
    LocalGrid::start(label, config, PARTITIONS, Arc::new(NoopEventPublisher)).expect("start grid")
}

/// Grid whose entry events are captured in the returned receiver.
pub fn start_grid_with_events(label: &str, config: GridConfig) -> (LocalGrid, mpsc::UnboundedReceiver<EntryEvent>) {
    let (events, rx) = ChannelEventPublisher::new();
    let grid = LocalGrid::start(label, config, PARTITIONS, Arc::new(events)).expect("start grid");
    (grid, rx)
}

pub async fn split(grid: &LocalGrid, label: &str) -> LocalGrid {
    grid.fork(label, Arc::new(NoopEventPublisher))
        .await
        .expect("fork grid")
}

pub fn merger(config: &GridConfig) -> SplitBrainMerger {
    SplitBrainMerger::new(Arc::new(config.clone()), Arc::new(MergePolicyRegistry::default()))
}

/// Contents of `cache` on the first backup replica of every partition.
pub async fn backup_cache(grid: &LocalGrid, cache: &str) -> BTreeMap<String, serde_json::Value> {
    grid.barrier().await.expect("barrier");
    let mut out = BTreeMap::new();
    for partition_id in 0..grid.partition_count() {
        let name = cache.to_string();
        let entries: Vec<(Vec<u8>, StoredValue)> = grid
            .backup_read(partition_id, 0, move |state| {
                state
                    .cache(&name)
                    .map(|store| {
                        store
                            .entries()
                            .map(|(key, record)| (key.clone(), record.value.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await
            .expect("read backup");
        for (key, value) in entries {
            let key = String::from_utf8(key).expect("utf8 key");
            out.insert(key, value.to_object().expect("decode value"));
        }
    }
    out
}

/// Values of `key` in `multimap` on the first backup replica of its partition.
pub async fn backup_values(grid: &LocalGrid, multimap: &str, key: &str) -> Vec<serde_json::Value> {
    grid.barrier().await.expect("barrier");
    let partition_id = grid.partition_for_key(key.as_bytes());
    let name = multimap.to_string();
    let key = key.as_bytes().to_vec();
    let values: Vec<StoredValue> = grid
        .backup_read(partition_id, 0, move |state| {
            state
                .container(&name)
                .and_then(|c| c.collection_wrapper(&key))
                .map(|w| w.records().iter().map(|r| r.object().clone()).collect())
                .unwrap_or_default()
        })
        .await
        .expect("read backup");
    values
        .into_iter()
        .map(|v| v.to_object().expect("decode value"))
        .collect()
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<EntryEvent>) -> Vec<EntryEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
