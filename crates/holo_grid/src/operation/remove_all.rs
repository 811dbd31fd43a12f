use std::time::Instant;

use crate::collection::Record;
use crate::event::EntryEventType;
use crate::types::{now_unix_ms, RecordId, StructureKind, WaitKey};

use super::backup::{BackupEffect, BackupOperation};
use super::protocol::{elapsed_ms, KeyTarget, Operation, OperationContext, Response};

/// Commit-time removal of every record a transaction reserved under one key.
///
/// All-or-nothing: if any reserved id is gone (removed by a concurrent
/// transaction, or by an earlier delivery of this very operation) nothing is
/// removed and the response is `false`. The caller must hold the key's lock;
/// that lock is released at the end of `run` whether or not anything was
/// removed. A release without removal is replicated as a plain unlock.
#[derive(Debug)]
pub struct TxnRemoveAllOperation {
    target: KeyTarget,
    record_ids: Vec<RecordId>,
    begin: Option<Instant>,
    removed: Option<Vec<Record>>,
    response: bool,
    released_lock: bool,
}

impl TxnRemoveAllOperation {
    pub fn new(target: KeyTarget, record_ids: Vec<RecordId>) -> Self {
        Self {
            target,
            record_ids,
            begin: None,
            removed: None,
            response: false,
            released_lock: false,
        }
    }

    pub fn from_records(target: KeyTarget, records: &[Record]) -> Self {
        Self::new(target, records.iter().map(Record::record_id).collect())
    }

    pub fn target(&self) -> &KeyTarget {
        &self.target
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.record_ids
    }

    /// Records removed by `run`; `None` when the operation had no effect.
    pub fn removed(&self) -> Option<&[Record]> {
        self.removed.as_deref()
    }

    /// Whether `run` released a lock held by the caller.
    pub fn released_lock(&self) -> bool {
        self.released_lock
    }
}

impl Operation for TxnRemoveAllOperation {
    fn name(&self) -> &'static str {
        "txn_remove_all"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        let KeyTarget {
            structure,
            key,
            caller_id,
            thread_id,
        } = &self.target;
        let container = ctx.state.get_or_create_container(structure);

        if !container.is_locked_by(key, *caller_id, *thread_id) {
            tracing::debug!(
                structure = %structure,
                caller_id = *caller_id,
                "remove-all rejected: key not reserved by caller"
            );
            self.response = false;
            return Ok(());
        }

        let now = now_unix_ms();
        let wrapper = container.get_or_create_collection_wrapper(key, now);
        if self.record_ids.iter().all(|id| wrapper.contains_record_id(*id)) {
            let removed: Vec<Record> = self
                .record_ids
                .iter()
                .filter_map(|id| wrapper.remove_record_id(*id))
                .collect();
            if !removed.is_empty() {
                wrapper.touch_update(now);
                self.removed = Some(removed);
            }
            self.response = true;
        } else {
            self.response = false;
        }

        container.remove_if_empty(key);
        self.released_lock = container.unlock(key, *caller_id, *thread_id);
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        {
            let container = ctx.state.get_or_create_container(&self.target.structure);
            if container.config().statistics_enabled {
                container
                    .operations_counter()
                    .increment_removes(elapsed_ms(self.begin));
            }
            if self.removed.is_some() {
                container.update();
            }
        }
        for record in self.removed.iter().flatten() {
            ctx.publish(
                EntryEventType::Removed,
                &self.target.structure,
                &self.target.key,
                Some(record.object().clone()),
            );
        }
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Bool(self.response)
    }

    fn should_backup(&self) -> bool {
        self.removed.is_some() || self.released_lock
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        // Backups apply the removal and the unlock together.
        let effect = if self.removed.is_some() {
            BackupEffect::RemoveRecordIds {
                record_ids: self.record_ids.clone(),
            }
        } else if self.released_lock {
            BackupEffect::Unlock
        } else {
            return None;
        };
        Some(BackupOperation {
            kind: StructureKind::MultiMap,
            structure: self.target.structure.clone(),
            key: self.target.key.clone(),
            caller_id: self.target.caller_id,
            thread_id: self.target.thread_id,
            effect,
        })
    }

    fn should_notify(&self) -> bool {
        self.removed.is_some()
    }

    fn notified_key(&self) -> Option<WaitKey> {
        Some(self.target.wait_key())
    }
}
