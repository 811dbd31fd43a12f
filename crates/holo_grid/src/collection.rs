//! Collection storage wiring.
//!
//! `record` holds the per-key collection representation, `container` the
//! per-partition registry with its lock table, and `stats` the operation
//! counters a container exposes.

mod container;
mod record;
mod stats;

pub use container::CollectionContainer;
pub use record::{CollectionWrapper, EntryStats, Record};
pub use stats::{OperationsCounter, OperationsSnapshot};
