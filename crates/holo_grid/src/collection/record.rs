//! Records and the per-key collection that holds them.

use crate::config::ValueCollectionType;
use crate::types::{Key, RecordId};
use crate::value::StoredValue;

/// One element of a keyed collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    record_id: RecordId,
    object: StoredValue,
}

impl Record {
    pub fn new(record_id: RecordId, object: StoredValue) -> Self {
        Self { record_id, object }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn object(&self) -> &StoredValue {
        &self.object
    }

    pub fn into_object(self) -> StoredValue {
        self.object
    }
}

/// Access/update statistics carried with an entry so merge policies can
/// compare both sides of a split without a network round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryStats {
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_update_time: u64,
    pub hits: u64,
}

impl EntryStats {
    pub fn created(now_ms: u64) -> Self {
        Self {
            creation_time: now_ms,
            last_access_time: 0,
            last_update_time: now_ms,
            hits: 0,
        }
    }

    pub fn on_access(&mut self, now_ms: u64) {
        self.hits = self.hits.saturating_add(1);
        self.last_access_time = self.last_access_time.max(now_ms);
    }

    pub fn on_update(&mut self, now_ms: u64) {
        self.last_update_time = self.last_update_time.max(now_ms);
    }
}

/// The collection of records stored under one key.
///
/// Records keep insertion order. The wrapper enforces set semantics when
/// configured; removal of the wrapper once empty is the container's job.
#[derive(Clone, Debug)]
pub struct CollectionWrapper {
    key: Key,
    collection_type: ValueCollectionType,
    records: Vec<Record>,
    stats: EntryStats,
}

impl CollectionWrapper {
    pub fn new(key: Key, collection_type: ValueCollectionType, now_ms: u64) -> Self {
        Self {
            key,
            collection_type,
            records: Vec::new(),
            stats: EntryStats::created(now_ms),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn collection_type(&self) -> ValueCollectionType {
        self.collection_type
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_record_id(&self, record_id: RecordId) -> bool {
        self.records.iter().any(|r| r.record_id == record_id)
    }

    pub fn contains_value(&self, value: &StoredValue) -> bool {
        self.records.iter().any(|r| &r.object == value)
    }

    /// Append `record`. Returns false when set semantics reject it as a duplicate.
    pub fn add(&mut self, record: Record) -> bool {
        if self.collection_type == ValueCollectionType::Set && self.contains_value(&record.object) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Remove the first record carrying `record_id`.
    pub fn remove_record_id(&mut self, record_id: RecordId) -> Option<Record> {
        let idx = self.records.iter().position(|r| r.record_id == record_id)?;
        Some(self.records.remove(idx))
    }

    pub fn replace_records(&mut self, records: Vec<Record>, stats: EntryStats) {
        self.records = records;
        self.stats = stats;
    }

    pub fn stats(&self) -> EntryStats {
        self.stats
    }

    pub fn touch_access(&mut self, now_ms: u64) {
        self.stats.on_access(now_ms);
    }

    pub fn touch_update(&mut self, now_ms: u64) {
        self.stats.on_update(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::InMemoryFormat;
    use serde_json::json;

    fn value(v: serde_json::Value) -> StoredValue {
        StoredValue::encode(InMemoryFormat::Binary, &v).expect("encode")
    }

    #[test]
    fn set_rejects_equal_values_list_keeps_them() {
        let mut set = CollectionWrapper::new(b"k".to_vec(), ValueCollectionType::Set, 1);
        assert!(set.add(Record::new(1, value(json!("a")))));
        assert!(!set.add(Record::new(2, value(json!("a")))));
        assert_eq!(set.len(), 1);

        let mut list = CollectionWrapper::new(b"k".to_vec(), ValueCollectionType::List, 1);
        assert!(list.add(Record::new(1, value(json!("a")))));
        assert!(list.add(Record::new(2, value(json!("a")))));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_record_id_takes_first_match_only() {
        let mut wrapper = CollectionWrapper::new(b"k".to_vec(), ValueCollectionType::List, 1);
        wrapper.add(Record::new(1, value(json!("a"))));
        wrapper.add(Record::new(2, value(json!("b"))));

        let removed = wrapper.remove_record_id(1).expect("record 1 present");
        assert_eq!(removed.record_id(), 1);
        assert!(wrapper.remove_record_id(1).is_none());
        assert!(wrapper.contains_record_id(2));
    }

    #[test]
    fn stats_track_hits_and_latest_times() {
        let mut stats = EntryStats::created(10);
        stats.on_access(20);
        stats.on_access(15);
        stats.on_update(30);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.last_access_time, 20);
        assert_eq!(stats.last_update_time, 30);
    }
}
