//! Per-partition collection registry and transactional lock table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StructureConfig;
use crate::types::{CallerId, Key, RecordId, ThreadId};

use super::record::CollectionWrapper;
use super::stats::OperationsCounter;

/// Owner of a transactional key lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct LockOwner {
    caller_id: CallerId,
    thread_id: ThreadId,
}

/// All collections of one multimap inside one partition.
///
/// The container is only touched from its partition's executor, so it needs
/// no interior locking. The lock table here is the transactional reservation
/// (caller + thread per key) spanning several client round trips, not a
/// mutual-exclusion primitive.
#[derive(Debug)]
pub struct CollectionContainer {
    name: String,
    config: StructureConfig,
    collections: HashMap<Key, CollectionWrapper>,
    locks: HashMap<Key, LockOwner>,
    next_record_id: RecordId,
    modification_count: u64,
    counter: Arc<OperationsCounter>,
}

impl CollectionContainer {
    pub fn new(name: &str, config: StructureConfig, counter: Arc<OperationsCounter>) -> Self {
        Self {
            name: name.to_string(),
            config,
            collections: HashMap::new(),
            locks: HashMap::new(),
            next_record_id: 0,
            modification_count: 0,
            counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    /// Return the wrapper for `key`, creating an empty one on first access.
    pub fn get_or_create_collection_wrapper(&mut self, key: &[u8], now_ms: u64) -> &mut CollectionWrapper {
        let collection_type = self.config.value_collection_type;
        self.collections
            .entry(key.to_vec())
            .or_insert_with(|| CollectionWrapper::new(key.to_vec(), collection_type, now_ms))
    }

    pub fn collection_wrapper(&self, key: &[u8]) -> Option<&CollectionWrapper> {
        self.collections.get(key)
    }

    pub fn collection_wrapper_mut(&mut self, key: &[u8]) -> Option<&mut CollectionWrapper> {
        self.collections.get_mut(key)
    }

    pub fn remove_collection(&mut self, key: &[u8]) -> Option<CollectionWrapper> {
        self.collections.remove(key)
    }

    /// Drop the wrapper for `key` if it holds no records. Returns true when removed.
    pub fn remove_if_empty(&mut self, key: &[u8]) -> bool {
        if self.collections.get(key).is_some_and(CollectionWrapper::is_empty) {
            self.collections.remove(key);
            return true;
        }
        false
    }

    pub fn insert_collection(&mut self, wrapper: CollectionWrapper) {
        for record in wrapper.records() {
            self.observe_record_id(record.record_id());
        }
        self.collections.insert(wrapper.key().to_vec(), wrapper);
    }

    pub fn next_record_id(&mut self) -> RecordId {
        self.next_record_id = self.next_record_id.saturating_add(1);
        self.next_record_id
    }

    /// Keep the generator ahead of ids created elsewhere (backups, merges) so
    /// a promoted replica never hands out an id that is already in use.
    pub fn observe_record_id(&mut self, record_id: RecordId) {
        self.next_record_id = self.next_record_id.max(record_id);
    }

    /// Acquire the transactional lock. Re-acquiring by the current owner succeeds.
    pub fn lock(&mut self, key: &[u8], caller_id: CallerId, thread_id: ThreadId) -> bool {
        let owner = LockOwner { caller_id, thread_id };
        match self.locks.get(key) {
            Some(current) if *current != owner => false,
            Some(_) => true,
            None => {
                self.locks.insert(key.to_vec(), owner);
                true
            }
        }
    }

    /// Release the lock held by `caller_id`/`thread_id` on `key`.
    ///
    /// Idempotent: unlocking an absent lock, or one held by a different owner,
    /// is a no-op. Returns true only when a lock was actually released.
    pub fn unlock(&mut self, key: &[u8], caller_id: CallerId, thread_id: ThreadId) -> bool {
        let owner = LockOwner { caller_id, thread_id };
        if self.locks.get(key) == Some(&owner) {
            self.locks.remove(key);
            return true;
        }
        false
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locks.contains_key(key)
    }

    pub fn is_locked_by(&self, key: &[u8], caller_id: CallerId, thread_id: ThreadId) -> bool {
        self.locks.get(key) == Some(&LockOwner { caller_id, thread_id })
    }

    /// Record a structural modification.
    pub fn update(&mut self) {
        self.modification_count = self.modification_count.wrapping_add(1);
    }

    pub fn modification_count(&self) -> u64 {
        self.modification_count
    }

    pub fn operations_counter(&self) -> &Arc<OperationsCounter> {
        &self.counter
    }

    /// Total number of records across all keys.
    pub fn size(&self) -> usize {
        self.collections.values().map(CollectionWrapper::len).sum()
    }

    pub fn key_count(&self) -> usize {
        self.collections.len()
    }

    pub fn wrappers(&self) -> impl Iterator<Item = &CollectionWrapper> {
        self.collections.values()
    }

    /// Deep copy with a fresh operations counter; used when a partition's
    /// state diverges into an independent copy.
    pub fn fork(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            collections: self.collections.clone(),
            locks: self.locks.clone(),
            next_record_id: self.next_record_id,
            modification_count: self.modification_count,
            counter: Arc::new(OperationsCounter::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Record;
    use crate::value::{InMemoryFormat, StoredValue};
    use serde_json::json;

    fn container() -> CollectionContainer {
        CollectionContainer::new("mm", StructureConfig::default(), Arc::new(OperationsCounter::new()))
    }

    #[test]
    fn unlock_is_idempotent_and_owner_scoped() {
        let mut c = container();
        assert!(c.lock(b"k", 1, 10));
        assert!(c.lock(b"k", 1, 10), "re-entry by owner succeeds");
        assert!(!c.lock(b"k", 2, 10), "different caller is rejected");

        assert!(!c.unlock(b"k", 2, 10), "non-owner unlock is a no-op");
        assert!(c.is_locked_by(b"k", 1, 10));
        assert!(c.unlock(b"k", 1, 10));
        assert!(!c.unlock(b"k", 1, 10), "second unlock is a no-op");
        assert!(!c.is_locked(b"k"));
    }

    #[test]
    fn get_or_create_returns_fresh_wrapper_after_removal() {
        let mut c = container();
        let id = c.next_record_id();
        let value = StoredValue::encode(InMemoryFormat::Binary, &json!("v")).expect("encode");
        c.get_or_create_collection_wrapper(b"k", 1).add(Record::new(id, value));
        assert_eq!(c.size(), 1);

        c.collection_wrapper_mut(b"k")
            .expect("wrapper")
            .remove_record_id(id);
        assert!(c.remove_if_empty(b"k"));
        assert!(c.collection_wrapper(b"k").is_none());

        let fresh = c.get_or_create_collection_wrapper(b"k", 2);
        assert!(fresh.is_empty());
        assert_eq!(fresh.stats().creation_time, 2);
    }

    #[test]
    fn observed_ids_are_never_reissued() {
        let mut c = container();
        assert_eq!(c.next_record_id(), 1);
        c.observe_record_id(40);
        assert_eq!(c.next_record_id(), 41);
        c.observe_record_id(5);
        assert_eq!(c.next_record_id(), 42);
    }
}
