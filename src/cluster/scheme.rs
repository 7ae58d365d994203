//! The partition scheme: who stores data now, and where it is headed when
//! the cluster is rebalancing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::PartitionId;

/// Where a partition's storage lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionAddr {
    /// This process.
    Local,
    /// A peer, as a dialable `host:port`.
    Remote(String),
}

/// `current` serves reads. While `target` is set the cluster is rebalancing:
/// writes go to the union, and the repair loop migrates `current \ target`
/// into `target`. Schemes are compared whole for change detection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme {
    pub current: BTreeMap<PartitionId, PartitionAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BTreeMap<PartitionId, PartitionAddr>>,
}

impl PartitionScheme {
    pub fn new(current: BTreeMap<PartitionId, PartitionAddr>) -> Self {
        Self {
            current,
            target: None,
        }
    }

    pub fn rebalancing(
        current: BTreeMap<PartitionId, PartitionAddr>,
        target: BTreeMap<PartitionId, PartitionAddr>,
    ) -> Self {
        Self {
            current,
            target: Some(target),
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.target.is_some()
    }

    /// Partitions that accept writes: the union of current and target.
    pub fn write_set(&self) -> BTreeMap<PartitionId, PartitionAddr> {
        let mut set = self.current.clone();
        if let Some(target) = &self.target {
            for (id, addr) in target {
                set.entry(id.clone()).or_insert_with(|| addr.clone());
            }
        }
        set
    }

    /// Partitions that serve reads.
    pub fn read_set(&self) -> &BTreeMap<PartitionId, PartitionAddr> {
        &self.current
    }

    /// Partitions that will be retired once rebalancing completes.
    pub fn outgoing(&self) -> BTreeSet<PartitionId> {
        match &self.target {
            None => BTreeSet::new(),
            Some(target) => self
                .current
                .keys()
                .filter(|id| !target.contains_key(*id))
                .cloned()
                .collect(),
        }
    }

    /// Promote `target` to `current`, ending the rebalance.
    pub fn promoted(&self) -> PartitionScheme {
        match &self.target {
            None => self.clone(),
            Some(target) => PartitionScheme::new(target.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme_of(ids: &[&str]) -> BTreeMap<PartitionId, PartitionAddr> {
        ids.iter()
            .map(|id| {
                (
                    PartitionId::new(*id),
                    PartitionAddr::Remote(format!("{id}:1000")),
                )
            })
            .collect()
    }

    #[test]
    fn write_set_is_the_union_while_rebalancing() {
        let scheme = PartitionScheme::rebalancing(scheme_of(&["a", "b"]), scheme_of(&["b", "c"]));
        let writes: Vec<_> = scheme.write_set().keys().cloned().collect();
        assert_eq!(
            writes,
            vec![
                PartitionId::new("a"),
                PartitionId::new("b"),
                PartitionId::new("c")
            ]
        );
        assert_eq!(scheme.read_set().len(), 2);
    }

    #[test]
    fn outgoing_is_current_minus_target() {
        let scheme = PartitionScheme::rebalancing(scheme_of(&["a", "b"]), scheme_of(&["b", "c"]));
        let outgoing: Vec<_> = scheme.outgoing().into_iter().collect();
        assert_eq!(outgoing, vec![PartitionId::new("a")]);
        assert!(PartitionScheme::new(scheme_of(&["a"])).outgoing().is_empty());
    }

    #[test]
    fn promotion_ends_the_rebalance() {
        let scheme = PartitionScheme::rebalancing(scheme_of(&["a", "b"]), scheme_of(&["b", "c"]));
        let promoted = scheme.promoted();
        assert!(!promoted.is_rebalancing());
        assert!(promoted.current.contains_key(&PartitionId::new("c")));
        assert!(!promoted.current.contains_key(&PartitionId::new("a")));
    }
}
