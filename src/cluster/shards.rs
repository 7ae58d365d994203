//! Rendezvous (highest-random-weight) sharding.
//!
//! Every key ranks every partition by `xxh3(key ‖ partition)`; its replicas
//! are the top R. Membership changes only move the keys that ranked the
//! departed (or arrived) partition into their top R, which is a `R/n`
//! fraction in expectation.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::core::PartitionId;

#[derive(Clone, Debug)]
pub struct RendezvousSharder {
    partitions: Vec<PartitionId>,
    replicas: usize,
}

impl RendezvousSharder {
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>, replicas: usize) -> Self {
        let mut partitions: Vec<PartitionId> = partitions.into_iter().collect();
        partitions.sort();
        partitions.dedup();
        Self {
            partitions,
            replicas: replicas.max(1),
        }
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    fn score<K: Hash>(key: &K, partition: &PartitionId) -> u64 {
        let mut hasher = Xxh3::new();
        key.hash(&mut hasher);
        partition.as_str().hash(&mut hasher);
        hasher.finish()
    }

    /// The top-R partitions for `key`, best first. Ties break on partition
    /// order, so the ranking is total and stable.
    pub fn top<K: Hash>(&self, key: &K) -> Vec<PartitionId> {
        let mut ranked: Vec<(u64, &PartitionId)> = self
            .partitions
            .iter()
            .map(|partition| (Self::score(key, partition), partition))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        ranked
            .into_iter()
            .take(self.replicas)
            .map(|(_, partition)| partition.clone())
            .collect()
    }

    /// The single best partition for `key`.
    pub fn primary<K: Hash>(&self, key: &K) -> Option<PartitionId> {
        self.top(key).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sharder(ids: &[&str], replicas: usize) -> RendezvousSharder {
        RendezvousSharder::new(ids.iter().map(|id| PartitionId::new(*id)), replicas)
    }

    #[test]
    fn ranking_is_deterministic() {
        let a = sharder(&["a", "b", "c", "d"], 2);
        let b = sharder(&["d", "c", "b", "a"], 2);
        for key in 0..100i64 {
            assert_eq!(a.top(&key), b.top(&key));
        }
    }

    #[test]
    fn top_is_r_distinct_partitions() {
        let sharder = sharder(&["a", "b", "c", "d"], 3);
        let top = sharder.top(&"some-key");
        assert_eq!(top.len(), 3);
        let mut dedup = top.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn replicas_clamp_to_partition_count() {
        let sharder = sharder(&["a", "b"], 5);
        assert_eq!(sharder.top(&1i64).len(), 2);
    }

    #[test]
    fn removal_only_disturbs_keys_that_ranked_the_removed_partition() {
        let before = sharder(&["a", "b", "c", "d"], 2);
        let after = sharder(&["a", "b", "d"], 2);
        let removed = PartitionId::new("c");

        for key in 0..1000i64 {
            let top_before = before.top(&key);
            if !top_before.contains(&removed) {
                assert_eq!(top_before, after.top(&key), "key {key} moved needlessly");
            }
        }
    }

    #[test]
    fn keys_spread_over_all_partitions() {
        let sharder = sharder(&["a", "b", "c", "d"], 1);
        let mut counts = std::collections::BTreeMap::new();
        for key in 0..4000i64 {
            let primary = sharder.primary(&key).unwrap();
            *counts.entry(primary).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), 4);
        for (_, count) in counts {
            // Expect ~1000 per partition; a wildly skewed hash would fail.
            assert!(count > 600, "partition underloaded: {count}");
        }
    }
}
