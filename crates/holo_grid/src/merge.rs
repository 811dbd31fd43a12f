//! Split-brain merge.
//!
//! After a partitioned cluster heals, every structure of the merging side is
//! replayed into the destination side key by key. `policy` decides per key,
//! `engine` applies the decisions on the destination partition's executor and
//! produces the backups that bring its replicas back in line.

mod engine;
mod policy;

pub use engine::{apply_merge, AppliedMerge, MergeReport, MergeRequest, MergeTarget, SplitBrainMerger};
pub use policy::{
    IntegerValuesComparator, MergeComparator, MergeDecision, MergeEntry, MergePolicy, MergePolicyRegistry,
};
