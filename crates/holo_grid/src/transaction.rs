//! Client-side multimap transaction.
//!
//! Every key a transaction touches is reserved first (lock-and-get on the
//! owner, waiting out competing reservations up to the lock timeout). Changes
//! are staged locally and reduced to, per key, the records to add and the
//! reserved record ids to remove. Commit ships them as `TxnPut`s followed by
//! one `TxnRemoveAll`, which also releases the reservation; keys without
//! removals are released with `TxnUnlock`. A key whose commit errors is
//! released and reported without stopping the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::collection::Record;
use crate::operation::{
    KeyTarget, Response, TxnGenerateRecordIdOperation, TxnPutOperation, TxnRemoveAllOperation,
    TxnUnlockOperation,
};
use crate::router::PartitionRouter;
use crate::types::{CallerId, Key, RecordId, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
struct KeyChanges {
    reserved: Vec<Record>,
    removed: Vec<RecordId>,
    added: Vec<(RecordId, serde_json::Value)>,
}

impl KeyChanges {
    fn visible_reserved(&self) -> impl Iterator<Item = &Record> {
        self.reserved
            .iter()
            .filter(|r| !self.removed.contains(&r.record_id()))
    }
}

/// A key whose reserved records changed underneath the transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: Key,
    /// Staged puts applied before the removals were refused. Puts run first,
    /// so these stay in place.
    pub applied_puts: usize,
}

/// What a commit achieved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Keys whose staged changes were applied in full.
    pub committed_keys: usize,
    /// Keys whose removals were refused; none of them were applied.
    pub conflicted_keys: Vec<KeyConflict>,
    /// Staged puts the owner refused (set semantics or redelivery).
    pub rejected_puts: usize,
    /// Keys whose commit errored part way. Their reservation was released
    /// wherever the owner still answered; earlier steps for the key stay.
    pub failed_keys: Vec<Key>,
}

impl CommitOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicted_keys.is_empty() && self.rejected_puts == 0 && self.failed_keys.is_empty()
    }
}

pub struct MultiMapTransaction {
    structure: String,
    caller_id: CallerId,
    thread_id: ThreadId,
    router: Arc<dyn PartitionRouter>,
    lock_timeout: Duration,
    keys: BTreeMap<Key, KeyChanges>,
    state: TxnState,
}

impl MultiMapTransaction {
    pub fn new(
        structure: &str,
        caller_id: CallerId,
        thread_id: ThreadId,
        router: Arc<dyn PartitionRouter>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            structure: structure.to_string(),
            caller_id,
            thread_id,
            router,
            lock_timeout,
            keys: BTreeMap::new(),
            state: TxnState::Active,
        }
    }

    pub fn caller_id(&self) -> CallerId {
        self.caller_id
    }

    fn target(&self, key: &[u8]) -> KeyTarget {
        KeyTarget::new(&self.structure, key, self.caller_id, self.thread_id)
    }

    async fn reserve(&mut self, key: &[u8]) -> anyhow::Result<&mut KeyChanges> {
        anyhow::ensure!(self.state == TxnState::Active, "transaction is no longer active");
        if !self.keys.contains_key(key) {
            let owner = self.router.owner_for_key(key)?;
            let Some(reserved) = owner.lock_and_get(self.target(key), self.lock_timeout).await? else {
                anyhow::bail!(
                    "timed out after {:?} reserving key in '{}'",
                    self.lock_timeout,
                    self.structure
                );
            };
            self.keys.insert(
                key.to_vec(),
                KeyChanges {
                    reserved,
                    ..KeyChanges::default()
                },
            );
        }
        self.keys
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("reserved key vanished from transaction"))
    }

    /// Values under `key` as this transaction sees them.
    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> anyhow::Result<Vec<serde_json::Value>> {
        let changes = self.reserve(key.as_ref()).await?;
        let mut values = changes
            .visible_reserved()
            .map(|r| r.object().to_object())
            .collect::<anyhow::Result<Vec<_>>>()?;
        values.extend(changes.added.iter().map(|(_, v)| v.clone()));
        Ok(values)
    }

    /// Stage `value` under `key`.
    pub async fn put(&mut self, key: impl AsRef<[u8]>, value: serde_json::Value) -> anyhow::Result<()> {
        let key = key.as_ref();
        self.reserve(key).await?;
        let record_id = self
            .router
            .owner_for_key(key)?
            .execute(TxnGenerateRecordIdOperation::new(&self.structure))
            .await?
            .into_record_id()?;
        if let Some(changes) = self.keys.get_mut(key) {
            changes.added.push((record_id, value));
        }
        Ok(())
    }

    /// Stage removal of one occurrence of `value`. Returns false when the
    /// transaction sees no such value.
    pub async fn remove(&mut self, key: impl AsRef<[u8]>, value: &serde_json::Value) -> anyhow::Result<bool> {
        let changes = self.reserve(key.as_ref()).await?;
        if let Some(idx) = changes.added.iter().position(|(_, v)| v == value) {
            changes.added.remove(idx);
            return Ok(true);
        }
        let found = changes
            .visible_reserved()
            .find(|r| r.object().to_object().ok().as_ref() == Some(value))
            .map(Record::record_id);
        match found {
            Some(record_id) => {
                changes.removed.push(record_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stage removal of every value under `key`; returns what was removed.
    pub async fn remove_all(&mut self, key: impl AsRef<[u8]>) -> anyhow::Result<Vec<serde_json::Value>> {
        let changes = self.reserve(key.as_ref()).await?;
        let mut removed_values = Vec::new();
        let mut removed_ids = Vec::new();
        for record in changes.visible_reserved() {
            removed_values.push(record.object().to_object()?);
            removed_ids.push(record.record_id());
        }
        changes.removed.extend(removed_ids);
        removed_values.extend(changes.added.drain(..).map(|(_, v)| v));
        Ok(removed_values)
    }

    /// Apply staged changes key by key. A key that fails does not stop the
    /// others; it is released and reported in `failed_keys`.
    pub async fn commit(mut self) -> anyhow::Result<CommitOutcome> {
        anyhow::ensure!(self.state == TxnState::Active, "transaction is no longer active");
        let keys = std::mem::take(&mut self.keys);
        self.state = TxnState::Committed;

        let mut outcome = CommitOutcome::default();
        for (key, changes) in keys {
            if let Err(err) = self.commit_key(&key, changes, &mut outcome).await {
                tracing::warn!(
                    error = ?err,
                    structure = %self.structure,
                    caller_id = self.caller_id,
                    "commit failed for key; releasing its reservation"
                );
                self.release_logged(&key).await;
                outcome.failed_keys.push(key);
            }
        }
        Ok(outcome)
    }

    async fn commit_key(&self, key: &[u8], changes: KeyChanges, outcome: &mut CommitOutcome) -> anyhow::Result<()> {
        let owner = self.router.owner_for_key(key)?;
        let mut applied_puts = 0;
        for (record_id, value) in changes.added {
            let response = owner
                .execute(TxnPutOperation::new(self.target(key), record_id, value))
                .await?;
            if response == Response::Bool(true) {
                applied_puts += 1;
            } else {
                outcome.rejected_puts += 1;
            }
        }

        if changes.removed.is_empty() {
            owner.execute(TxnUnlockOperation::new(self.target(key))).await?;
            outcome.committed_keys += 1;
            return Ok(());
        }

        let response = owner
            .execute(TxnRemoveAllOperation::new(self.target(key), changes.removed))
            .await?;
        if response == Response::Bool(true) {
            outcome.committed_keys += 1;
        } else {
            tracing::debug!(
                structure = %self.structure,
                caller_id = self.caller_id,
                applied_puts,
                "reserved records changed before commit; removals not applied"
            );
            outcome.conflicted_keys.push(KeyConflict {
                key: key.to_vec(),
                applied_puts,
            });
        }
        Ok(())
    }

    async fn release(&self, key: &[u8]) -> anyhow::Result<()> {
        let owner = self.router.owner_for_key(key)?;
        owner.execute(TxnUnlockOperation::new(self.target(key))).await?;
        Ok(())
    }

    async fn release_logged(&self, key: &[u8]) {
        if let Err(err) = self.release(key).await {
            tracing::warn!(
                error = ?err,
                structure = %self.structure,
                caller_id = self.caller_id,
                "could not release reservation"
            );
        }
    }

    /// Release every reservation without applying staged changes. Every key
    /// is attempted; the first failure is returned.
    pub async fn rollback(mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.state == TxnState::Active, "transaction is no longer active");
        let keys = std::mem::take(&mut self.keys);
        self.state = TxnState::RolledBack;
        let mut first_err = None;
        for key in keys.into_keys() {
            if let Err(err) = self.release(&key).await {
                tracing::warn!(
                    error = ?err,
                    structure = %self.structure,
                    caller_id = self.caller_id,
                    "rollback could not release reservation"
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MultiMapTransaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active && !self.keys.is_empty() {
            tracing::warn!(
                structure = %self.structure,
                caller_id = self.caller_id,
                keys = self.keys.len(),
                "transaction dropped without commit or rollback; keys stay reserved"
            );
        }
    }
}
