//! Per-partition cache record store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::collection::{EntryStats, OperationsCounter};
use crate::config::StructureConfig;
use crate::types::Key;
use crate::value::StoredValue;

#[derive(Clone, Debug, PartialEq)]
pub struct CacheRecord {
    pub value: StoredValue,
    pub stats: EntryStats,
}

/// Entries of one cache inside one partition.
#[derive(Debug)]
pub struct CacheRecordStore {
    name: String,
    config: StructureConfig,
    records: HashMap<Key, CacheRecord>,
    counter: Arc<OperationsCounter>,
}

impl CacheRecordStore {
    pub fn new(name: &str, config: StructureConfig, counter: Arc<OperationsCounter>) -> Self {
        Self {
            name: name.to_string(),
            config,
            records: HashMap::new(),
            counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    /// Insert or overwrite `key`. Returns the stored record and the previous value.
    pub fn put(&mut self, key: &[u8], value: StoredValue, now_ms: u64) -> (CacheRecord, Option<StoredValue>) {
        match self.records.get_mut(key) {
            Some(record) => {
                let old = std::mem::replace(&mut record.value, value);
                record.stats.on_update(now_ms);
                (record.clone(), Some(old))
            }
            None => {
                let record = CacheRecord {
                    value,
                    stats: EntryStats::created(now_ms),
                };
                self.records.insert(key.to_vec(), record.clone());
                (record, None)
            }
        }
    }

    /// Read `key`, counting a hit and the access time.
    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Option<StoredValue> {
        let record = self.records.get_mut(key)?;
        record.stats.on_access(now_ms);
        Some(record.value.clone())
    }

    /// Read `key` without touching its statistics.
    pub fn peek(&self, key: &[u8]) -> Option<&CacheRecord> {
        self.records.get(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<CacheRecord> {
        self.records.remove(key)
    }

    /// Install `record` verbatim, statistics included (backup and merge paths).
    pub fn replace_record(&mut self, key: &[u8], record: CacheRecord) {
        self.records.insert(key.to_vec(), record);
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &CacheRecord)> {
        self.records.iter()
    }

    pub fn operations_counter(&self) -> &Arc<OperationsCounter> {
        &self.counter
    }

    pub fn fork(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            records: self.records.clone(),
            counter: Arc::new(OperationsCounter::new()),
        }
    }
}
