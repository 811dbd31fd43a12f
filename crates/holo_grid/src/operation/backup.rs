//! Effect descriptors replicated to backup replicas.
//!
//! A backup operation is built from the primary's outcome once `run`
//! finished; it never references the primary operation's mutable fields and
//! carries record ids rather than payloads wherever the replica already holds
//! the payload.

use crate::cache::CacheRecord;
use crate::collection::{EntryStats, Record};
use crate::partition::PartitionState;
use crate::types::{now_unix_ms, CallerId, Key, RecordId, StructureKind, ThreadId};

#[derive(Clone, Debug, PartialEq)]
pub enum BackupEffect {
    /// Mirror a transactional reservation so it survives failover.
    Lock,
    Unlock,
    PutRecord { record: Record },
    /// Remove records by id; ids the replica no longer holds are ignored.
    RemoveRecordIds { record_ids: Vec<RecordId> },
    /// Full state of one multimap key (`None` removes it); used by merge re-sync.
    ReplaceCollection { collection: Option<(Vec<Record>, EntryStats)> },
    CachePut { record: CacheRecord },
    CacheRemove,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackupOperation {
    pub kind: StructureKind,
    pub structure: String,
    pub key: Key,
    pub caller_id: CallerId,
    pub thread_id: ThreadId,
    pub effect: BackupEffect,
}

impl BackupOperation {
    /// Apply the effect to a replica's state. Releases the originating
    /// caller's reservation wherever the primary released it.
    pub fn apply(&self, state: &mut PartitionState) -> anyhow::Result<()> {
        match (self.kind, &self.effect) {
            (StructureKind::MultiMap, effect) => self.apply_multimap(state, effect),
            (StructureKind::Cache, BackupEffect::CachePut { record }) => {
                state
                    .get_or_create_cache(&self.structure)
                    .replace_record(&self.key, record.clone());
                Ok(())
            }
            (StructureKind::Cache, BackupEffect::CacheRemove) => {
                state.get_or_create_cache(&self.structure).remove(&self.key);
                Ok(())
            }
            (StructureKind::Cache, other) => {
                anyhow::bail!("backup effect {other:?} does not apply to cache '{}'", self.structure)
            }
        }
    }

    fn apply_multimap(&self, state: &mut PartitionState, effect: &BackupEffect) -> anyhow::Result<()> {
        let container = state.get_or_create_container(&self.structure);
        let key = self.key.as_slice();
        match effect {
            BackupEffect::Lock => {
                if !container.lock(key, self.caller_id, self.thread_id) {
                    tracing::warn!(
                        structure = %self.structure,
                        caller_id = self.caller_id,
                        "backup lock conflicts with existing reservation; keeping replica owner"
                    );
                }
            }
            BackupEffect::Unlock => {
                container.unlock(key, self.caller_id, self.thread_id);
            }
            BackupEffect::PutRecord { record } => {
                container.observe_record_id(record.record_id());
                let wrapper = container.get_or_create_collection_wrapper(key, now_unix_ms());
                if !wrapper.contains_record_id(record.record_id()) {
                    wrapper.add(record.clone());
                }
                container.remove_if_empty(key);
                container.update();
            }
            BackupEffect::RemoveRecordIds { record_ids } => {
                if let Some(wrapper) = container.collection_wrapper_mut(key) {
                    for record_id in record_ids {
                        wrapper.remove_record_id(*record_id);
                    }
                }
                container.remove_if_empty(key);
                container.update();
                container.unlock(key, self.caller_id, self.thread_id);
            }
            BackupEffect::ReplaceCollection { collection } => {
                match collection {
                    Some((records, stats)) if !records.is_empty() => {
                        for record in records {
                            container.observe_record_id(record.record_id());
                        }
                        container
                            .get_or_create_collection_wrapper(key, stats.creation_time)
                            .replace_records(records.clone(), *stats);
                    }
                    _ => {
                        container.remove_collection(key);
                    }
                }
                container.update();
            }
            BackupEffect::CachePut { .. } | BackupEffect::CacheRemove => {
                anyhow::bail!(
                    "backup effect {effect:?} does not apply to multimap '{}'",
                    self.structure
                );
            }
        }
        Ok(())
    }
}
