//! Applying merge decisions to a destination partition and walking the
//! merging side's partitions.

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::cache::{CacheRecord, CacheRecordStore};
use crate::collection::{CollectionContainer, CollectionWrapper, Record};
use crate::config::GridConfig;
use crate::event::{EntryEvent, EntryEventType, EventPublisher};
use crate::operation::{BackupEffect, BackupOperation};
use crate::partition::{PartitionHandle, PartitionState};
use crate::types::{now_unix_ms, PartitionId, StructureKind, WaitKey};
use crate::value::StoredValue;

use super::policy::{MergeDecision, MergeEntry, MergePolicy, MergePolicyRegistry};

/// Entries of one structure from the merging side, with the policy the
/// destination must apply to them.
#[derive(Clone, Debug)]
pub struct MergeRequest {
    pub kind: StructureKind,
    pub structure: String,
    pub policy: MergePolicy,
    pub entries: Vec<MergeEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub partition_id: PartitionId,
    pub kind: Option<StructureKind>,
    pub structure: String,
    pub policy: String,
    pub examined: usize,
    pub accepted: usize,
    pub kept: usize,
    pub discarded: usize,
    pub skipped: usize,
}

/// Result of applying a merge request: the report for the caller, plus the
/// re-sync backups and wait keys the executor must handle afterwards.
#[derive(Debug)]
pub struct AppliedMerge {
    pub report: MergeReport,
    pub backups: Vec<BackupOperation>,
    pub notified: Vec<WaitKey>,
}

/// A structure a merge can be applied to.
pub trait MergeTarget {
    const KIND: StructureKind;

    fn merging_entries(&self) -> Vec<MergeEntry>;

    fn existing_entry(&self, key: &[u8]) -> Option<MergeEntry>;

    /// Install `entry`, creating or overwriting its key.
    fn accept(&mut self, entry: MergeEntry) -> anyhow::Result<()>;

    /// Remove the key. Returns the values that were removed.
    fn discard(&mut self, key: &[u8]) -> Vec<StoredValue>;

    /// Backup effect that brings a replica's copy of `key` in line with this one.
    fn resync_effect(&self, key: &[u8]) -> BackupEffect;
}

impl MergeTarget for CacheRecordStore {
    const KIND: StructureKind = StructureKind::Cache;

    fn merging_entries(&self) -> Vec<MergeEntry> {
        self.entries()
            .map(|(key, record)| MergeEntry {
                key: key.clone(),
                values: vec![record.value.clone()],
                stats: record.stats,
            })
            .collect()
    }

    fn existing_entry(&self, key: &[u8]) -> Option<MergeEntry> {
        self.peek(key).map(|record| MergeEntry {
            key: key.to_vec(),
            values: vec![record.value.clone()],
            stats: record.stats,
        })
    }

    fn accept(&mut self, entry: MergeEntry) -> anyhow::Result<()> {
        let MergeEntry { key, values, stats } = entry;
        let Some(value) = values.into_iter().next() else {
            anyhow::bail!("merging cache entry has no value");
        };
        let value = value.into_format(self.config().in_memory_format)?;
        self.replace_record(&key, CacheRecord { value, stats });
        Ok(())
    }

    fn discard(&mut self, key: &[u8]) -> Vec<StoredValue> {
        self.remove(key).map(|r| vec![r.value]).unwrap_or_default()
    }

    fn resync_effect(&self, key: &[u8]) -> BackupEffect {
        match self.peek(key) {
            Some(record) => BackupEffect::CachePut {
                record: record.clone(),
            },
            None => BackupEffect::CacheRemove,
        }
    }
}

impl MergeTarget for CollectionContainer {
    const KIND: StructureKind = StructureKind::MultiMap;

    fn merging_entries(&self) -> Vec<MergeEntry> {
        self.wrappers()
            .filter(|wrapper| !wrapper.is_empty())
            .map(|wrapper| MergeEntry {
                key: wrapper.key().to_vec(),
                values: wrapper.records().iter().map(|r| r.object().clone()).collect(),
                stats: wrapper.stats(),
            })
            .collect()
    }

    fn existing_entry(&self, key: &[u8]) -> Option<MergeEntry> {
        let wrapper = self.collection_wrapper(key)?;
        if wrapper.is_empty() {
            return None;
        }
        Some(MergeEntry {
            key: key.to_vec(),
            values: wrapper.records().iter().map(|r| r.object().clone()).collect(),
            stats: wrapper.stats(),
        })
    }

    /// Record ids from the other side are meaningless here, so accepted
    /// values get fresh ids from this container.
    fn accept(&mut self, entry: MergeEntry) -> anyhow::Result<()> {
        let MergeEntry { key, values, stats } = entry;
        let format = self.config().in_memory_format;
        let mut wrapper = CollectionWrapper::new(key, self.config().value_collection_type, stats.creation_time);
        for value in values {
            let value = value.into_format(format)?;
            wrapper.add(Record::new(self.next_record_id(), value));
        }
        let records = wrapper.records().to_vec();
        wrapper.replace_records(records, stats);
        if wrapper.is_empty() {
            self.remove_collection(wrapper.key());
        } else {
            self.insert_collection(wrapper);
        }
        self.update();
        Ok(())
    }

    fn discard(&mut self, key: &[u8]) -> Vec<StoredValue> {
        let removed = self
            .remove_collection(key)
            .map(|wrapper| wrapper.records().iter().map(|r| r.object().clone()).collect())
            .unwrap_or_default();
        self.update();
        removed
    }

    fn resync_effect(&self, key: &[u8]) -> BackupEffect {
        BackupEffect::ReplaceCollection {
            collection: self
                .collection_wrapper(key)
                .map(|wrapper| (wrapper.records().to_vec(), wrapper.stats())),
        }
    }
}

/// Apply `request` to the destination partition's `state`.
///
/// Each merging key is decided independently. A policy error skips the key
/// (logged) and leaves it for a later resync. Keys that changed get a
/// re-sync backup and a MERGED (accepted) or REMOVED (discarded) event.
pub fn apply_merge(
    state: &mut PartitionState,
    request: MergeRequest,
    events: &dyn EventPublisher,
) -> anyhow::Result<AppliedMerge> {
    let partition_id = state.partition_id();
    let MergeRequest {
        kind,
        structure,
        policy,
        entries,
    } = request;
    let mut applied = AppliedMerge {
        report: MergeReport {
            partition_id,
            kind: Some(kind),
            structure: structure.clone(),
            policy: policy.name().to_string(),
            ..MergeReport::default()
        },
        backups: Vec::new(),
        notified: Vec::new(),
    };

    match kind {
        StructureKind::Cache => {
            let store = state.get_or_create_cache(&structure);
            merge_into(store, &structure, &policy, entries, events, &mut applied);
        }
        StructureKind::MultiMap => {
            let container = state.get_or_create_container(&structure);
            merge_into(container, &structure, &policy, entries, events, &mut applied);
        }
    }

    tracing::debug!(
        partition_id,
        structure = %structure,
        policy = %applied.report.policy,
        accepted = applied.report.accepted,
        kept = applied.report.kept,
        discarded = applied.report.discarded,
        skipped = applied.report.skipped,
        "merge applied"
    );
    Ok(applied)
}

fn merge_into<T: MergeTarget>(
    target: &mut T,
    structure: &str,
    policy: &MergePolicy,
    entries: Vec<MergeEntry>,
    events: &dyn EventPublisher,
    applied: &mut AppliedMerge,
) {
    for merging in entries {
        applied.report.examined += 1;
        let key = merging.key.clone();
        let existing = target.existing_entry(&key);

        let decision = match policy.merge(&merging, existing.as_ref()) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    error = ?err,
                    structure = %structure,
                    policy = policy.name(),
                    "merge policy failed; skipping key"
                );
                applied.report.skipped += 1;
                continue;
            }
        };

        let event = match decision {
            MergeDecision::KeepExisting => {
                applied.report.kept += 1;
                continue;
            }
            MergeDecision::AcceptMerging => {
                if let Err(err) = target.accept(merging) {
                    tracing::warn!(
                        error = ?err,
                        structure = %structure,
                        "merging entry could not be installed; skipping key"
                    );
                    applied.report.skipped += 1;
                    continue;
                }
                applied.report.accepted += 1;
                let value = target
                    .existing_entry(&key)
                    .and_then(|entry| entry.values.into_iter().next());
                (EntryEventType::Merged, value)
            }
            MergeDecision::Discard => {
                applied.report.discarded += 1;
                if existing.is_none() {
                    continue;
                }
                let removed = target.discard(&key);
                (EntryEventType::Removed, removed.into_iter().next())
            }
        };

        events.publish_event(EntryEvent {
            event_type: event.0,
            structure: structure.to_string(),
            key: key.clone(),
            value: event.1,
        });
        applied.backups.push(BackupOperation {
            kind: T::KIND,
            structure: structure.to_string(),
            key: key.clone(),
            caller_id: 0,
            thread_id: 0,
            effect: target.resync_effect(&key),
        });
        if T::KIND == StructureKind::MultiMap {
            applied.notified.push(WaitKey::new(structure, &key));
        }
    }
}

/// Everything one partition replica holds, as merge requests without a policy.
fn merge_snapshot(state: &PartitionState) -> Vec<(StructureKind, String, Vec<MergeEntry>)> {
    let caches = state
        .caches()
        .map(|store| (StructureKind::Cache, store.name().to_string(), store.merging_entries()));
    let multimaps = state.multimaps().map(|container| {
        (
            StructureKind::MultiMap,
            container.name().to_string(),
            container.merging_entries(),
        )
    });
    caches.chain(multimaps).collect()
}

/// Drives a heal: every structure of every merging partition is applied to
/// the destination partition with the same id, using each structure's
/// configured policy.
pub struct SplitBrainMerger {
    config: Arc<GridConfig>,
    registry: Arc<MergePolicyRegistry>,
}

impl SplitBrainMerger {
    pub fn new(config: Arc<GridConfig>, registry: Arc<MergePolicyRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn policy_for(&self, structure: &str) -> anyhow::Result<MergePolicy> {
        self.registry
            .resolve(&self.config.structure(structure).merge_policy)
    }

    /// Merge every structure `source` holds into `destination`. Structures
    /// that exist only on the merging side are created on the destination
    /// even when empty.
    pub async fn merge_partition(
        &self,
        source: &PartitionHandle,
        destination: &PartitionHandle,
    ) -> anyhow::Result<Vec<MergeReport>> {
        anyhow::ensure!(
            source.partition_id() == destination.partition_id(),
            "cannot merge partition {} into partition {}",
            source.partition_id(),
            destination.partition_id()
        );
        let snapshot = source.read(merge_snapshot).await?;
        let mut reports = Vec::with_capacity(snapshot.len());
        for (kind, structure, entries) in snapshot {
            let policy = self.policy_for(&structure)?;
            let report = destination
                .merge(MergeRequest {
                    kind,
                    structure,
                    policy,
                    entries,
                })
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Merge all `(source, destination)` pairs concurrently. Every pair is
    /// attempted; the first failure is returned after all have finished.
    pub async fn merge_all(
        &self,
        pairs: Vec<(PartitionHandle, PartitionHandle)>,
    ) -> anyhow::Result<Vec<MergeReport>> {
        let mut pending: FuturesUnordered<_> = pairs
            .iter()
            .map(|(source, destination)| self.merge_partition(source, destination))
            .collect();

        let mut reports = Vec::new();
        let mut first_error = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(mut partition_reports) => reports.append(&mut partition_reports),
                Err(err) => {
                    tracing::warn!(error = ?err, "partition merge failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        reports.sort_by(|a, b| {
            (a.partition_id, &a.structure).cmp(&(b.partition_id, &b.structure))
        });
        Ok(reports)
    }
}
