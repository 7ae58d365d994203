//! Timestamp-wrapped value: the later write wins, ties break on the value.

use serde::{Deserialize, Serialize};

use super::crdt::Crdt;
use super::Stamp;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lww<T> {
    pub value: T,
    pub updated: Stamp,
}

impl<T> Lww<T> {
    pub fn new(value: T, updated: Stamp) -> Self {
        Self { value, updated }
    }
}

impl<T> Crdt for Lww<T>
where
    T: Ord + Clone + Send + 'static,
{
    fn join(a: Self, b: Self) -> Self {
        match a.updated.cmp(&b.updated) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            // Same stamp from two writers: value order keeps the join
            // commutative.
            std::cmp::Ordering::Equal => {
                if a.value >= b.value {
                    a
                } else {
                    b
                }
            }
        }
    }

    fn extract(&self, since: Option<Stamp>) -> Option<Self> {
        match since {
            Some(cutoff) if self.updated < cutoff => None,
            _ => Some(self.clone()),
        }
    }
}
