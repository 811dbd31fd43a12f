//! Client-side views of a cache and a multimap.

use std::sync::Arc;

use crate::operation::{
    CacheGetOperation, CachePutOperation, CacheRemoveOperation, CollectionGetOperation, Response,
};
use crate::router::PartitionRouter;
use crate::value::StoredValue;

fn into_object(value: Option<StoredValue>) -> anyhow::Result<Option<serde_json::Value>> {
    value.map(|v| v.to_object()).transpose()
}

#[derive(Clone)]
pub struct CacheProxy {
    name: String,
    router: Arc<dyn PartitionRouter>,
}

impl CacheProxy {
    pub fn new(name: &str, router: Arc<dyn PartitionRouter>) -> Self {
        Self {
            name: name.to_string(),
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `value` under `key`; returns the previous value.
    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: serde_json::Value,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let key = key.as_ref();
        let owner = self.router.owner_for_key(key)?;
        let response = owner
            .execute(CachePutOperation::new(&self.name, key, value))
            .await?;
        into_object(response.into_value()?)
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<serde_json::Value>> {
        let key = key.as_ref();
        let owner = self.router.owner_for_key(key)?;
        let response = owner.execute(CacheGetOperation::new(&self.name, key)).await?;
        into_object(response.into_value()?)
    }

    pub async fn remove(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<serde_json::Value>> {
        let key = key.as_ref();
        let owner = self.router.owner_for_key(key)?;
        let response = owner.execute(CacheRemoveOperation::new(&self.name, key)).await?;
        into_object(response.into_value()?)
    }

    /// Entries across all partition owners.
    pub async fn size(&self) -> anyhow::Result<usize> {
        let mut total = 0;
        for partition_id in 0..self.router.partition_count() {
            let name = self.name.clone();
            total += self
                .router
                .owner(partition_id)?
                .read(move |state| state.cache(&name).map_or(0, |store| store.size()))
                .await?;
        }
        Ok(total)
    }
}

#[derive(Clone)]
pub struct MultiMapProxy {
    name: String,
    router: Arc<dyn PartitionRouter>,
}

impl MultiMapProxy {
    pub fn new(name: &str, router: Arc<dyn PartitionRouter>) -> Self {
        Self {
            name: name.to_string(),
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Values stored under `key`, in insertion order.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Vec<serde_json::Value>> {
        let key = key.as_ref();
        let owner = self.router.owner_for_key(key)?;
        match owner.execute(CollectionGetOperation::new(&self.name, key)).await? {
            Response::Records(records) => records.iter().map(|r| r.object().to_object()).collect(),
            other => anyhow::bail!("unexpected collection get response {other:?}"),
        }
    }

    pub async fn value_count(&self, key: impl AsRef<[u8]>) -> anyhow::Result<usize> {
        let key = key.as_ref().to_vec();
        let name = self.name.clone();
        self.router
            .owner_for_key(&key)?
            .read(move |state| {
                state
                    .container(&name)
                    .and_then(|c| c.collection_wrapper(&key))
                    .map_or(0, |w| w.len())
            })
            .await
    }

    pub async fn is_locked(&self, key: impl AsRef<[u8]>) -> anyhow::Result<bool> {
        let key = key.as_ref().to_vec();
        let name = self.name.clone();
        self.router
            .owner_for_key(&key)?
            .read(move |state| state.container(&name).is_some_and(|c| c.is_locked(&key)))
            .await
    }

    /// Records across all partition owners.
    pub async fn size(&self) -> anyhow::Result<usize> {
        let mut total = 0;
        for partition_id in 0..self.router.partition_count() {
            let name = self.name.clone();
            total += self
                .router
                .owner(partition_id)?
                .read(move |state| state.container(&name).map_or(0, |c| c.size()))
                .await?;
        }
        Ok(total)
    }
}
