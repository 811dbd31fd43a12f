//! Operation contract and the driver that sequences its phases.

use std::time::Instant;

use crate::collection::Record;
use crate::event::{EntryEvent, EntryEventType, EventPublisher};
use crate::partition::PartitionState;
use crate::types::{CallerId, Key, RecordId, ThreadId, WaitKey};
use crate::value::StoredValue;

use super::backup::BackupOperation;

/// Result handed back to the invoker once `run`/`after_run` completed.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Bool(bool),
    RecordId(RecordId),
    Records(Vec<Record>),
    Value(Option<StoredValue>),
}

impl Response {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Self::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn into_value(self) -> anyhow::Result<Option<StoredValue>> {
        match self {
            Self::Value(value) => Ok(value),
            other => anyhow::bail!("expected value response, got {other:?}"),
        }
    }

    pub fn into_record_id(self) -> anyhow::Result<RecordId> {
        match self {
            Self::RecordId(id) => Ok(id),
            other => anyhow::bail!("expected record id response, got {other:?}"),
        }
    }
}

/// Mutable view an operation gets while it executes on the partition executor.
pub struct OperationContext<'a> {
    pub state: &'a mut PartitionState,
    pub events: &'a dyn EventPublisher,
}

impl OperationContext<'_> {
    pub fn publish(&self, event_type: EntryEventType, structure: &str, key: &[u8], value: Option<StoredValue>) {
        self.events.publish_event(EntryEvent {
            event_type,
            structure: structure.to_string(),
            key: key.to_vec(),
            value,
        });
    }
}

/// Addressing shared by key-based operations: structure, key and the lock owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyTarget {
    pub structure: String,
    pub key: Key,
    pub caller_id: CallerId,
    pub thread_id: ThreadId,
}

impl KeyTarget {
    pub fn new(structure: &str, key: &[u8], caller_id: CallerId, thread_id: ThreadId) -> Self {
        Self {
            structure: structure.to_string(),
            key: key.to_vec(),
            caller_id,
            thread_id,
        }
    }

    pub fn wait_key(&self) -> WaitKey {
        WaitKey::new(&self.structure, &self.key)
    }
}

/// A mutation or read executed at the partition owner.
///
/// Phases, in order: `run` (validate and mutate, once), `after_run`
/// (statistics and events), then `should_backup`/`backup_operation` and
/// `should_notify`/`notified_key`. Only operations whose mutation had an
/// effect produce a backup or a notification.
pub trait Operation: Send + 'static {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()>;

    fn after_run(&mut self, _ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn response(&self) -> Response;

    fn should_backup(&self) -> bool {
        false
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        None
    }

    fn should_notify(&self) -> bool {
        false
    }

    fn notified_key(&self) -> Option<WaitKey> {
        None
    }
}

/// What the executor must do after an operation ran.
#[derive(Debug)]
pub struct OperationOutcome {
    pub response: Response,
    pub backup: Option<BackupOperation>,
    pub notified_key: Option<WaitKey>,
}

/// Drive `op` through its phases against `ctx`.
pub fn execute_operation(op: &mut dyn Operation, ctx: &mut OperationContext<'_>) -> anyhow::Result<OperationOutcome> {
    op.run(ctx)?;
    op.after_run(ctx)?;

    let backup = if op.should_backup() {
        op.backup_operation()
    } else {
        None
    };
    let notified_key = if op.should_notify() {
        op.notified_key()
    } else {
        None
    };

    Ok(OperationOutcome {
        response: op.response(),
        backup,
        notified_key,
    })
}

/// Milliseconds since `begin`, or zero when the operation never started.
pub(super) fn elapsed_ms(begin: Option<Instant>) -> u64 {
    begin
        .map(|b| b.elapsed().as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
