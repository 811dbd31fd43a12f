//! Merge policies: the per-entry decision taken when two copies of a key meet.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::collection::EntryStats;
use crate::types::Key;
use crate::value::StoredValue;

/// One side of a merge: the key's values plus the statistics carried across
/// the split. Cache entries hold exactly one value; multimap entries hold the
/// key's whole collection.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeEntry {
    pub key: Key,
    pub values: Vec<StoredValue>,
    pub stats: EntryStats,
}

impl MergeEntry {
    pub fn value(&self) -> Option<&StoredValue> {
        self.values.first()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeDecision {
    /// Leave the destination as it is.
    KeepExisting,
    /// Install the merging entry, creating or overwriting the key.
    AcceptMerging,
    /// Drop the merging entry and remove the existing one, if any.
    Discard,
}

/// Value-aware extension point for policies outside the standard catalog.
///
/// Must be deterministic: the same pair of entries always yields the same
/// decision, independent of other keys.
pub trait MergeComparator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn merge(&self, merging: &MergeEntry, existing: Option<&MergeEntry>) -> anyhow::Result<MergeDecision>;
}

#[derive(Clone)]
pub enum MergePolicy {
    Discard,
    PassThrough,
    PutIfAbsent,
    HigherHits,
    LatestAccess,
    LatestUpdate,
    Custom(Arc<dyn MergeComparator>),
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(comparator) => f.debug_tuple("Custom").field(&comparator.name()).finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl MergePolicy {
    pub fn name(&self) -> &str {
        match self {
            Self::Discard => "discard",
            Self::PassThrough => "pass-through",
            Self::PutIfAbsent => "put-if-absent",
            Self::HigherHits => "higher-hits",
            Self::LatestAccess => "latest-access",
            Self::LatestUpdate => "latest-update",
            Self::Custom(comparator) => comparator.name(),
        }
    }

    /// Decide what happens to `merging` given the destination's `existing` entry.
    pub fn merge(&self, merging: &MergeEntry, existing: Option<&MergeEntry>) -> anyhow::Result<MergeDecision> {
        let decision = match self {
            Self::Discard => MergeDecision::KeepExisting,
            Self::PassThrough => MergeDecision::AcceptMerging,
            Self::PutIfAbsent => match existing {
                None => MergeDecision::AcceptMerging,
                Some(_) => MergeDecision::KeepExisting,
            },
            Self::HigherHits => prefer_merging(merging, existing, |s| s.hits),
            Self::LatestAccess => prefer_merging(merging, existing, |s| s.last_access_time),
            Self::LatestUpdate => prefer_merging(merging, existing, |s| s.last_update_time),
            Self::Custom(comparator) => return comparator.merge(merging, existing),
        };
        Ok(decision)
    }
}

/// Accept the merging entry when the destination lacks the key or when the
/// merging side's metric is strictly greater. Ties keep the existing entry.
fn prefer_merging(
    merging: &MergeEntry,
    existing: Option<&MergeEntry>,
    metric: impl Fn(&EntryStats) -> u64,
) -> MergeDecision {
    match existing {
        None => MergeDecision::AcceptMerging,
        Some(existing) if metric(&merging.stats) > metric(&existing.stats) => MergeDecision::AcceptMerging,
        Some(_) => MergeDecision::KeepExisting,
    }
}

/// Accepts integer payloads and discards everything else.
#[derive(Debug, Default)]
pub struct IntegerValuesComparator;

impl MergeComparator for IntegerValuesComparator {
    fn name(&self) -> &str {
        "integer-values"
    }

    fn merge(&self, merging: &MergeEntry, _existing: Option<&MergeEntry>) -> anyhow::Result<MergeDecision> {
        let Some(value) = merging.value() else {
            return Ok(MergeDecision::Discard);
        };
        let object = value.to_object()?;
        if object.is_i64() || object.is_u64() {
            Ok(MergeDecision::AcceptMerging)
        } else {
            Ok(MergeDecision::Discard)
        }
    }
}

/// Resolves configured policy identifiers.
///
/// Identifiers are matched loosely: a dotted prefix is dropped, case,
/// dashes and underscores are ignored, and a trailing `MergePolicy` is
/// optional. `put-if-absent`, `PutIfAbsent` and
/// `com.example.PutIfAbsentMergePolicy` all resolve to the same policy.
pub struct MergePolicyRegistry {
    custom: HashMap<String, Arc<dyn MergeComparator>>,
}

impl Default for MergePolicyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let integers: Arc<dyn MergeComparator> = Arc::new(IntegerValuesComparator);
        registry.register("integer-values", integers.clone());
        registry.register("merge-integer-values", integers);
        registry
    }
}

impl MergePolicyRegistry {
    /// Registry with only the standard catalog.
    pub fn empty() -> Self {
        Self {
            custom: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: &str, comparator: Arc<dyn MergeComparator>) {
        self.custom.insert(normalize(id), comparator);
    }

    pub fn resolve(&self, id: &str) -> anyhow::Result<MergePolicy> {
        let normalized = normalize(id);
        let policy = match normalized.as_str() {
            "discard" => MergePolicy::Discard,
            "passthrough" => MergePolicy::PassThrough,
            "putifabsent" => MergePolicy::PutIfAbsent,
            "higherhits" => MergePolicy::HigherHits,
            "latestaccess" => MergePolicy::LatestAccess,
            "latestupdate" => MergePolicy::LatestUpdate,
            other => match self.custom.get(other) {
                Some(comparator) => MergePolicy::Custom(comparator.clone()),
                None => anyhow::bail!("unknown merge policy '{id}'"),
            },
        };
        Ok(policy)
    }
}

fn normalize(id: &str) -> String {
    let last = id.trim().rsplit('.').next().unwrap_or_default();
    let mut normalized: String = last
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect();
    if normalized.len() > "mergepolicy".len() && normalized.ends_with("mergepolicy") {
        normalized.truncate(normalized.len() - "mergepolicy".len());
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::InMemoryFormat;
    use serde_json::json;

    fn entry(value: serde_json::Value, hits: u64, access: u64, update: u64) -> MergeEntry {
        MergeEntry {
            key: b"k".to_vec(),
            values: vec![StoredValue::encode(InMemoryFormat::Binary, &value).expect("encode")],
            stats: EntryStats {
                creation_time: 1,
                last_access_time: access,
                last_update_time: update,
                hits,
            },
        }
    }

    #[test]
    fn absent_existing_is_accepted_by_stat_policies() {
        let merging = entry(json!("m"), 0, 0, 0);
        for policy in [
            MergePolicy::PassThrough,
            MergePolicy::PutIfAbsent,
            MergePolicy::HigherHits,
            MergePolicy::LatestAccess,
            MergePolicy::LatestUpdate,
        ] {
            assert_eq!(
                policy.merge(&merging, None).expect("merge"),
                MergeDecision::AcceptMerging,
                "{policy:?}"
            );
        }
        assert_eq!(
            MergePolicy::Discard.merge(&merging, None).expect("merge"),
            MergeDecision::KeepExisting
        );
    }

    #[test]
    fn stat_policies_keep_existing_on_ties() {
        let merging = entry(json!("m"), 3, 10, 10);
        let existing = entry(json!("e"), 3, 10, 10);
        for policy in [MergePolicy::HigherHits, MergePolicy::LatestAccess, MergePolicy::LatestUpdate] {
            assert_eq!(
                policy.merge(&merging, Some(&existing)).expect("merge"),
                MergeDecision::KeepExisting,
                "{policy:?}"
            );
        }
    }

    #[test]
    fn stat_policies_compare_their_own_metric() {
        let existing = entry(json!("e"), 2, 50, 50);
        let more_hits = entry(json!("m"), 3, 0, 0);
        let later_access = entry(json!("m"), 0, 60, 0);
        let later_update = entry(json!("m"), 0, 0, 60);

        assert_eq!(
            MergePolicy::HigherHits.merge(&more_hits, Some(&existing)).expect("merge"),
            MergeDecision::AcceptMerging
        );
        assert_eq!(
            MergePolicy::HigherHits.merge(&later_access, Some(&existing)).expect("merge"),
            MergeDecision::KeepExisting
        );
        assert_eq!(
            MergePolicy::LatestAccess.merge(&later_access, Some(&existing)).expect("merge"),
            MergeDecision::AcceptMerging
        );
        assert_eq!(
            MergePolicy::LatestUpdate.merge(&later_update, Some(&existing)).expect("merge"),
            MergeDecision::AcceptMerging
        );
        assert_eq!(
            MergePolicy::LatestUpdate.merge(&later_access, Some(&existing)).expect("merge"),
            MergeDecision::KeepExisting
        );
    }

    #[test]
    fn decisions_are_repeatable() {
        let merging = entry(json!("m"), 5, 7, 9);
        let existing = entry(json!("e"), 4, 8, 9);
        let registry = MergePolicyRegistry::default();
        for id in ["higher-hits", "latest-access", "latest-update", "integer-values"] {
            let policy = registry.resolve(id).expect("resolve");
            let first = policy.merge(&merging, Some(&existing)).expect("merge");
            for _ in 0..5 {
                assert_eq!(policy.merge(&merging, Some(&existing)).expect("merge"), first);
            }
        }
    }

    #[test]
    fn integer_comparator_accepts_only_integers() {
        let policy = MergePolicyRegistry::default()
            .resolve("com.example.MergeIntegerValuesMergePolicy")
            .expect("resolve");
        let existing = entry(json!("value"), 0, 0, 0);
        assert_eq!(
            policy.merge(&entry(json!(1), 0, 0, 0), Some(&existing)).expect("merge"),
            MergeDecision::AcceptMerging
        );
        assert_eq!(
            policy.merge(&entry(json!("text"), 0, 0, 0), Some(&existing)).expect("merge"),
            MergeDecision::Discard
        );
        assert_eq!(
            policy.merge(&entry(json!(1.5), 0, 0, 0), None).expect("merge"),
            MergeDecision::Discard
        );
    }

    #[test]
    fn identifiers_resolve_loosely() {
        let registry = MergePolicyRegistry::default();
        for id in [
            "put-if-absent",
            "PutIfAbsent",
            "put_if_absent",
            "com.example.grid.PutIfAbsentMergePolicy",
        ] {
            assert_eq!(registry.resolve(id).expect("resolve").name(), "put-if-absent", "{id}");
        }
        assert_eq!(registry.resolve("LatestUpdateMergePolicy").expect("resolve").name(), "latest-update");
        assert!(registry.resolve("no-such-policy").is_err());
        assert!(MergePolicyRegistry::empty().resolve("integer-values").is_err());
    }
}
