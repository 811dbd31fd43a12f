use std::time::Instant;

use crate::cache::CacheRecord;
use crate::event::EntryEventType;
use crate::types::{now_unix_ms, Key, StructureKind};
use crate::value::StoredValue;

use super::backup::{BackupEffect, BackupOperation};
use super::protocol::{elapsed_ms, Operation, OperationContext, Response};

fn cache_backup(cache: &str, key: &[u8], effect: BackupEffect) -> BackupOperation {
    BackupOperation {
        kind: StructureKind::Cache,
        structure: cache.to_string(),
        key: key.to_vec(),
        caller_id: 0,
        thread_id: 0,
        effect,
    }
}

/// Insert or overwrite a cache entry; responds with the previous value.
#[derive(Debug)]
pub struct CachePutOperation {
    cache: String,
    key: Key,
    value: serde_json::Value,
    begin: Option<Instant>,
    stored: Option<CacheRecord>,
    previous: Option<StoredValue>,
}

impl CachePutOperation {
    pub fn new(cache: &str, key: &[u8], value: serde_json::Value) -> Self {
        Self {
            cache: cache.to_string(),
            key: key.to_vec(),
            value,
            begin: None,
            stored: None,
            previous: None,
        }
    }
}

impl Operation for CachePutOperation {
    fn name(&self) -> &'static str {
        "cache_put"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        let store = ctx.state.get_or_create_cache(&self.cache);
        let value = StoredValue::encode(store.config().in_memory_format, &self.value)?;
        let (record, previous) = store.put(&self.key, value, now_unix_ms());
        self.stored = Some(record);
        self.previous = previous;
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        {
            let store = ctx.state.get_or_create_cache(&self.cache);
            if store.config().statistics_enabled {
                store.operations_counter().increment_adds(elapsed_ms(self.begin));
            }
        }
        let event_type = if self.previous.is_some() {
            EntryEventType::Updated
        } else {
            EntryEventType::Added
        };
        let value = self.stored.as_ref().map(|r| r.value.clone());
        ctx.publish(event_type, &self.cache, &self.key, value);
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Value(self.previous.clone())
    }

    fn should_backup(&self) -> bool {
        self.stored.is_some()
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        let record = self.stored.clone()?;
        Some(cache_backup(&self.cache, &self.key, BackupEffect::CachePut { record }))
    }
}

/// Read a cache entry, counting a hit on it.
#[derive(Debug)]
pub struct CacheGetOperation {
    cache: String,
    key: Key,
    begin: Option<Instant>,
    value: Option<StoredValue>,
}

impl CacheGetOperation {
    pub fn new(cache: &str, key: &[u8]) -> Self {
        Self {
            cache: cache.to_string(),
            key: key.to_vec(),
            begin: None,
            value: None,
        }
    }
}

impl Operation for CacheGetOperation {
    fn name(&self) -> &'static str {
        "cache_get"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        self.value = ctx
            .state
            .get_or_create_cache(&self.cache)
            .get(&self.key, now_unix_ms());
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        let store = ctx.state.get_or_create_cache(&self.cache);
        if store.config().statistics_enabled {
            store.operations_counter().increment_gets(elapsed_ms(self.begin));
        }
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Value(self.value.clone())
    }
}

#[derive(Debug)]
pub struct CacheRemoveOperation {
    cache: String,
    key: Key,
    begin: Option<Instant>,
    removed: Option<CacheRecord>,
}

impl CacheRemoveOperation {
    pub fn new(cache: &str, key: &[u8]) -> Self {
        Self {
            cache: cache.to_string(),
            key: key.to_vec(),
            begin: None,
            removed: None,
        }
    }
}

impl Operation for CacheRemoveOperation {
    fn name(&self) -> &'static str {
        "cache_remove"
    }

    fn run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        self.begin = Some(Instant::now());
        self.removed = ctx.state.get_or_create_cache(&self.cache).remove(&self.key);
        Ok(())
    }

    fn after_run(&mut self, ctx: &mut OperationContext<'_>) -> anyhow::Result<()> {
        {
            let store = ctx.state.get_or_create_cache(&self.cache);
            if store.config().statistics_enabled {
                store
                    .operations_counter()
                    .increment_removes(elapsed_ms(self.begin));
            }
        }
        if let Some(record) = &self.removed {
            ctx.publish(
                EntryEventType::Removed,
                &self.cache,
                &self.key,
                Some(record.value.clone()),
            );
        }
        Ok(())
    }

    fn response(&self) -> Response {
        Response::Value(self.removed.as_ref().map(|r| r.value.clone()))
    }

    fn should_backup(&self) -> bool {
        self.removed.is_some()
    }

    fn backup_operation(&self) -> Option<BackupOperation> {
        Some(cache_backup(&self.cache, &self.key, BackupEffect::CacheRemove))
    }
}
