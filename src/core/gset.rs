//! Grow-only set: join is union, extraction is identity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::crdt::Crdt;
use super::Stamp;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GSet<T: Ord>(BTreeSet<T>);

impl<T: Ord> GSet<T> {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(items: impl IntoIterator<Item = T>) -> Self {
        Self(items.into_iter().collect())
    }

    pub fn insert(&mut self, item: T) -> bool {
        self.0.insert(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.0.contains(item)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T> Crdt for GSet<T>
where
    T: Ord + Clone + Send + 'static,
{
    fn join(a: Self, b: Self) -> Self {
        let mut merged = a.0;
        merged.extend(b.0);
        Self(merged)
    }

    fn extract(&self, _since: Option<Stamp>) -> Option<Self> {
        Some(self.clone())
    }
}
