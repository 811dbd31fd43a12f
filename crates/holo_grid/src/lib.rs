//! Transactional collection/cache core for a partitioned, replicated grid.
//!
//! The crate has two halves. The operation protocol (`operation`) runs
//! mutations at a partition owner, replicates their effect to backups and
//! wakes blocked waiters. The merge engine (`merge`) reconciles two divergent
//! copies of a partition after a split brain heals.
//!
//! Membership, routing and transport are external concerns; the crate only
//! depends on the small traits in `partition` and `router` and ships
//! in-process implementations of them (`LocalGrid`) for tests and the
//! simulator.

pub mod cache;
pub mod collection;
pub mod config;
pub mod event;
pub mod grid;
pub mod merge;
pub mod notify;
pub mod operation;
pub mod partition;
pub mod proxy;
pub mod router;
pub mod transaction;
pub mod types;
pub mod value;

pub use config::{GridConfig, StructureConfig};
pub use grid::LocalGrid;
pub use types::{CallerId, Key, PartitionId, RecordId, ReplicaId, ThreadId, WaitKey};
pub use value::{InMemoryFormat, StoredValue};
