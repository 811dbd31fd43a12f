//! Multimap operations driven by a client transaction: reserve, generate ids,
//! stage puts, release. Plus the plain keyed read.

use std::time::Instant;

use crate::collection::Record;
use crate::event::EntryEventType;
use crate::types::{now_unix_ms, Key, RecordId, StructureKind, WaitKey};
use crate::value::StoredValue;

use super::backup::{BackupEffect, BackupOperation};
use super::protocol::{elapsed_ms, KeyTarget, Operation, OperationContext, Response};

fn backup_for(target: &KeyTarget, effect: BackupEffect) -> BackupOperation {
    BackupOperation {
        kind: StructureKind::MultiMap,
        structure: target.structure.clone(),
        key: target.key.clone(),
        caller_id: target.caller_id,
        thread_id: target.thread_id,
        effect,
    }
}

/// Reserve `key` for the caller and return the records it currently holds.
///
/// Responds `Bool(false)` when another owner holds the reservation; callers
/// that want to block wait on the key's wait key and retry.
#[derive(Debug)]
pub struct TxnLockAndGetOperation {
    target: KeyTarget,
    begin: Option<Instant>,
    records: Option<Vec<Record>>,
}

impl TxnLockAndGetOperation {
    pub fn new(target: KeyTarget) -> Self {
        Self {
            target,
            begin: None,
            records: None,
        }
    }
}

impl Operation for TxnLockAndGetOperation {
    fn name(&self) -> &'static str {
        "txn_lock_and_get"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        let t = &self.target;
        let container = ctx.state.get_or_create_container(&t.structure);
        if !container.lock(&t.key, t.caller_id, t.thread_id) {
            return Ok(());
        }
        let records = container
            .collection_wrapper_mut(&t.key)
            .map(|wrapper| {
                wrapper.touch_access(now_unix_ms());
                wrapper.records().to_vec()
            })
            .unwrap_or_default();
        self.records = Some(records);
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        let container = ctx.state.get_or_create_container(&self.target.structure);
        if container.config().statistics_enabled {
            container
                .operations_counter()
                .increment_others(elapsed_ms(self.begin));
        }
        Ok(())
    }

    fn response(&self) -> Response {
        match &self.records {
            Some(records) => Response::Records(records.clone()),
            None => Response::Bool(false),
        }
    }

    fn should_backup(&self) -> bool {
        self.records.is_some()
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        Some(backup_for(&self.target, BackupEffect::Lock))
    }
}

/// Hand out a fresh record id for a record the transaction is about to stage.
#[derive(Debug)]
pub struct TxnGenerateRecordIdOperation {
    structure: String,
    record_id: RecordId,
}

impl TxnGenerateRecordIdOperation {
    pub fn new(structure: &str) -> Self {
        Self {
            structure: structure.to_string(),
            record_id: 0,
        }
    }
}

impl Operation for TxnGenerateRecordIdOperation {
    fn name(&self) -> &'static str {
        "txn_generate_record_id"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.record_id = ctx
            .state
            .get_or_create_container(&self.structure)
            .next_record_id();
        Ok(())
    }

    fn response(&self) -> Response {
        Response::RecordId(self.record_id)
    }
}

/// Add a record staged by a transaction under its reserved id.
///
/// Fails (`Bool(false)`) when the caller does not hold the key's
/// reservation, when the id is already present (redelivery) or when set semantics reject the
/// value. Does not release the reservation.
#[derive(Debug)]
pub struct TxnPutOperation {
    target: KeyTarget,
    record_id: RecordId,
    value: serde_json::Value,
    begin: Option<Instant>,
    added: Option<Record>,
}

impl TxnPutOperation {
    pub fn new(target: KeyTarget, record_id: RecordId, value: serde_json::Value) -> Self {
        Self {
            target,
            record_id,
            value,
            begin: None,
            added: None,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }
}

impl Operation for TxnPutOperation {
    fn name(&self) -> &'static str {
        "txn_put"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        let t = &self.target;
        let container = ctx.state.get_or_create_container(&t.structure);
        if !container.is_locked_by(&t.key, t.caller_id, t.thread_id) {
            tracing::debug!(
                structure = %t.structure,
                caller_id = t.caller_id,
                "txn put rejected: key not reserved by caller"
            );
            return Ok(());
        }
        let object = StoredValue::encode(container.config().in_memory_format, &self.value)?;
        container.observe_record_id(self.record_id);

        let now = now_unix_ms();
        let wrapper = container.get_or_create_collection_wrapper(&t.key, now);
        let record = Record::new(self.record_id, object);
        if !wrapper.contains_record_id(self.record_id) && wrapper.add(record.clone()) {
            wrapper.touch_update(now);
            self.added = Some(record);
        }
        container.remove_if_empty(&t.key);
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        {
            let container = ctx.state.get_or_create_container(&self.target.structure);
            if container.config().statistics_enabled {
                container
                    .operations_counter()
                    .increment_adds(elapsed_ms(self.begin));
            }
            if self.added.is_some() {
                container.update();
            }
        }
        if let Some(record) = &self.added {
            ctx.publish(
                EntryEventType::Added,
                &self.target.structure,
                &self.target.key,
                Some(record.object().clone()),
            );
        }
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Bool(self.added.is_some())
    }

    fn should_backup(&self) -> bool {
        self.added.is_some()
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        let record = self.added.clone()?;
        Some(backup_for(&self.target, BackupEffect::PutRecord { record }))
    }

    fn should_notify(&self) -> bool {
        self.added.is_some()
    }

    fn notified_key(&self) -> Option<WaitKey> {
        Some(self.target.wait_key())
    }
}

/// Release the caller's reservation on a key (commit without removals, or rollback).
#[derive(Debug)]
pub struct TxnUnlockOperation {
    target: KeyTarget,
    released: bool,
}

impl TxnUnlockOperation {
    pub fn new(target: KeyTarget) -> Self {
        Self { target, released: false }
    }
}

impl Operation for TxnUnlockOperation {
    fn name(&self) -> &'static str {
        "txn_unlock"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        let t = &self.target;
        let container = ctx.state.get_or_create_container(&t.structure);
        self.released = container.unlock(&t.key, t.caller_id, t.thread_id);
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Bool(self.released)
    }

    fn should_backup(&self) -> bool {
        self.released
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        Some(backup_for(&self.target, BackupEffect::Unlock))
    }

    fn should_notify(&self) -> bool {
        self.released
    }

    fn notified_key(&self) -> Option<WaitKey> {
        Some(self.target.wait_key())
    }
}

/// Non-transactional read of every record under a key.
#[derive(Debug)]
pub struct CollectionGetOperation {
    structure: String,
    key: Key,
    begin: Option<Instant>,
    records: Vec<Record>,
}

impl CollectionGetOperation {
    pub fn new(structure: &str, key: &[u8]) -> Self {
        Self {
            structure: structure.to_string(),
            key: key.to_vec(),
            begin: None,
            records: Vec::new(),
        }
    }
}

impl Operation for CollectionGetOperation {
    fn name(&self) -> &'static str {
        "collection_get"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        let container = ctx.state.get_or_create_container(&self.structure);
        if let Some(wrapper) = container.collection_wrapper_mut(&self.key) {
            wrapper.touch_access(now_unix_ms());
            self.records = wrapper.records().to_vec();
        }
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        let container = ctx.state.get_or_create_container(&self.structure);
        if container.config().statistics_enabled {
            container
                .operations_counter()
                .increment_gets(elapsed_ms(self.begin));
        }
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Records(self.records.clone())
    }
}
