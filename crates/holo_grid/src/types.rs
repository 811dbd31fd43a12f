//! Identifier types shared by the collection, operation and merge layers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Opaque serialized key.
pub type Key = Vec<u8>;
/// Identifier of one record inside a collection; monotonic per container.
pub type RecordId = u64;
/// Identity of the member/client that issued an operation.
pub type CallerId = u64;
/// Thread identity inside the caller, part of the lock owner.
pub type ThreadId = u64;
pub type PartitionId = u32;
/// Identity of one replica (primary or backup) of a partition.
pub type ReplicaId = u64;

/// Kind of distributed structure an operation or backup targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    MultiMap,
    Cache,
}

/// Key that blocked operations wait on and mutations notify.
///
/// Derived from the structure name and the entry key only, never from record
/// ids, so any successful mutation of a key wakes every waiter on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WaitKey {
    pub structure: String,
    pub key: Key,
}

impl WaitKey {
    pub fn new(structure: &str, key: &[u8]) -> Self {
        Self {
            structure: structure.to_string(),
            key: key.to_vec(),
        }
    }
}

/// Wall-clock unix time in milliseconds.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}
