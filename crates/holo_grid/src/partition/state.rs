use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::CacheRecordStore;
use crate::collection::{CollectionContainer, OperationsCounter};
use crate::config::GridConfig;
use crate::types::PartitionId;

/// Everything one replica of one partition holds. Owned by the replica's
/// executor task; never shared.
#[derive(Debug)]
pub struct PartitionState {
    partition_id: PartitionId,
    config: Arc<GridConfig>,
    multimaps: BTreeMap<String, CollectionContainer>,
    caches: BTreeMap<String, CacheRecordStore>,
}

impl PartitionState {
    pub fn new(partition_id: PartitionId, config: Arc<GridConfig>) -> Self {
        Self {
            partition_id,
            config,
            multimaps: BTreeMap::new(),
            caches: BTreeMap::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn config(&self) -> &Arc<GridConfig> {
        &self.config
    }

    pub fn get_or_create_container(&mut self, name: &str) -> &mut CollectionContainer {
        self.multimaps.entry(name.to_string()).or_insert_with(|| {
            CollectionContainer::new(
                name,
                self.config.structure(name).clone(),
                Arc::new(OperationsCounter::new()),
            )
        })
    }

    pub fn container(&self, name: &str) -> Option<&CollectionContainer> {
        self.multimaps.get(name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut CollectionContainer> {
        self.multimaps.get_mut(name)
    }

    pub fn get_or_create_cache(&mut self, name: &str) -> &mut CacheRecordStore {
        self.caches.entry(name.to_string()).or_insert_with(|| {
            CacheRecordStore::new(
                name,
                self.config.structure(name).clone(),
                Arc::new(OperationsCounter::new()),
            )
        })
    }

    pub fn cache(&self, name: &str) -> Option<&CacheRecordStore> {
        self.caches.get(name)
    }

    pub fn multimaps(&self) -> impl Iterator<Item = &CollectionContainer> {
        self.multimaps.values()
    }

    pub fn caches(&self) -> impl Iterator<Item = &CacheRecordStore> {
        self.caches.values()
    }

    /// Independent deep copy; counters start from zero.
    pub fn fork(&self) -> Self {
        Self {
            partition_id: self.partition_id,
            config: self.config.clone(),
            multimaps: self
                .multimaps
                .iter()
                .map(|(name, container)| (name.clone(), container.fork()))
                .collect(),
            caches: self
                .caches
                .iter()
                .map(|(name, store)| (name.clone(), store.fork()))
                .collect(),
        }
    }
}
