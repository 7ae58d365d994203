//! K-way key-ordered merge of record/tombstone streams.
//!
//! Every source must be key-sorted. Entries for the same key across sources
//! are folded: states join, the newest tombstone shadows everything at or
//! below its stamp, and the survivor is extracted at the requested cutoff.

use crate::core::{Crdt, Key, Record, Stamp, Tombstone};

use super::StorageError;

#[derive(Clone, Debug)]
pub enum StreamEntry<K, S> {
    Record(Record<K, S>),
    Tombstone(Tombstone<K>),
}

impl<K, S> StreamEntry<K, S> {
    pub fn key(&self) -> &K {
        match self {
            StreamEntry::Record(record) => &record.key,
            StreamEntry::Tombstone(tombstone) => &tombstone.key,
        }
    }
}

pub type EntryStream<K, S> =
    Box<dyn Iterator<Item = Result<StreamEntry<K, S>, StorageError>> + Send>;

pub struct MergeSource<K, S> {
    pub label: String,
    pub stream: EntryStream<K, S>,
}

impl<K, S> MergeSource<K, S> {
    pub fn new(label: impl Into<String>, stream: EntryStream<K, S>) -> Self {
        Self {
            label: label.into(),
            stream,
        }
    }

    pub fn records(
        label: impl Into<String>,
        stream: Box<dyn Iterator<Item = Result<Record<K, S>, StorageError>> + Send>,
    ) -> Self
    where
        K: 'static,
        S: 'static,
    {
        Self::new(
            label,
            Box::new(stream.map(|item| item.map(StreamEntry::Record))),
        )
    }
}

/// What to do when a source stream fails mid-merge.
pub enum FailurePolicy {
    /// Surface the source error as-is and end the merge.
    Propagate,
    /// Drop failing sources until the budget runs out, then fail the merge
    /// with an exhaustion error naming every failed source.
    Tolerate { budget: usize, required: usize },
}

struct SourceState<K, S> {
    label: String,
    stream: EntryStream<K, S>,
    head: Option<StreamEntry<K, S>>,
}

pub struct MergeJoin<K, S> {
    sources: Vec<SourceState<K, S>>,
    since: Option<Stamp>,
    policy: FailurePolicy,
    failed: Vec<(String, String)>,
    poisoned: bool,
}

impl<K: Key, S: Crdt> MergeJoin<K, S> {
    pub fn new(sources: Vec<MergeSource<K, S>>, since: Option<Stamp>, policy: FailurePolicy) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| SourceState {
                label: source.label,
                stream: source.stream,
                head: None,
            })
            .collect();
        Self {
            sources,
            since,
            policy,
            failed: Vec::new(),
            poisoned: false,
        }
    }

    /// Pre-record failures that happened before the merge started (sessions
    /// that never opened). They count against the tolerance budget.
    pub fn with_prior_failures(mut self, failures: Vec<(String, String)>) -> Self {
        self.failed = failures;
        self
    }

    fn fill_heads(&mut self) -> Result<(), StorageError> {
        let mut index = 0;
        while index < self.sources.len() {
            if self.sources[index].head.is_some() {
                index += 1;
                continue;
            }
            match self.sources[index].stream.next() {
                Some(Ok(entry)) => {
                    self.sources[index].head = Some(entry);
                    index += 1;
                }
                Some(Err(err)) => {
                    let label = self.sources[index].label.clone();
                    self.sources.swap_remove(index);
                    self.note_failure(label, err)?;
                }
                None => {
                    self.sources.swap_remove(index);
                }
            }
        }
        Ok(())
    }

    fn note_failure(&mut self, label: String, err: StorageError) -> Result<(), StorageError> {
        match &self.policy {
            FailurePolicy::Propagate => Err(err),
            FailurePolicy::Tolerate { budget, required } => {
                tracing::warn!(source = %label, error = %err, "merge source dropped");
                self.failed.push((label, err.to_string()));
                if self.failed.len() > *budget {
                    Err(StorageError::Exhausted {
                        required: *required,
                        acked: self.sources.len(),
                        attempted: self
                            .failed
                            .iter()
                            .map(|(label, cause)| {
                                (crate::core::PartitionId::new(label.clone()), cause.clone())
                            })
                            .collect(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn fold_min_key(&mut self) -> Result<Option<Record<K, S>>, StorageError> {
        loop {
            self.fill_heads()?;
            let min_key = self
                .sources
                .iter()
                .filter_map(|source| source.head.as_ref().map(StreamEntry::key))
                .min()
                .cloned();
            let Some(key) = min_key else {
                return Ok(None);
            };

            let mut state: Option<(S, Stamp)> = None;
            let mut tombstone: Option<Stamp> = None;
            for source in &mut self.sources {
                let matches = source
                    .head
                    .as_ref()
                    .is_some_and(|entry| *entry.key() == key);
                if !matches {
                    continue;
                }
                match source.head.take().expect("head checked above") {
                    StreamEntry::Record(record) => {
                        state = Some(match state {
                            None => (record.state, record.stamp),
                            Some((folded, stamp)) => (
                                S::join(folded, record.state),
                                stamp.max(record.stamp),
                            ),
                        });
                    }
                    StreamEntry::Tombstone(entry) => {
                        tombstone = Some(tombstone.map_or(entry.stamp, |t| t.max(entry.stamp)));
                    }
                }
            }

            if let Some(folded) = fold_visible(state, tombstone, self.since) {
                return Ok(Some(Record::new(key, folded.0, folded.1)));
            }
            // Fully shadowed or extracted away; move on to the next key.
        }
    }
}

/// Apply the tombstone rule and the extraction cutoff to a folded key.
pub fn fold_visible<S: Crdt>(
    state: Option<(S, Stamp)>,
    tombstone: Option<Stamp>,
    since: Option<Stamp>,
) -> Option<(S, Stamp)> {
    let (state, stamp) = state?;
    if tombstone.is_some_and(|t| t >= stamp) {
        return None;
    }
    let visible = state.extract(since)?;
    Some((visible, stamp))
}

impl<K: Key, S: Crdt> Iterator for MergeJoin<K, S> {
    type Item = Result<Record<K, S>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        match self.fold_min_key() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.poisoned = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GSet;

    fn record_stream(
        records: Vec<Record<i64, GSet<i32>>>,
    ) -> EntryStream<i64, GSet<i32>> {
        Box::new(records.into_iter().map(|r| Ok(StreamEntry::Record(r))))
    }

    fn failing_stream(err_after: Vec<Record<i64, GSet<i32>>>) -> EntryStream<i64, GSet<i32>> {
        let ok = err_after.into_iter().map(|r| Ok(StreamEntry::Record(r)));
        let tail = std::iter::once(Err(StorageError::Shutdown));
        Box::new(ok.chain(tail))
    }

    #[test]
    fn duplicate_keys_join_across_sources() {
        let a = record_stream(vec![
            Record::new(1, GSet::of([1, 2]), Stamp::new(5)),
            Record::new(3, GSet::of([9]), Stamp::new(5)),
        ]);
        let b = record_stream(vec![
            Record::new(1, GSet::of([3]), Stamp::new(7)),
            Record::new(2, GSet::of([4]), Stamp::new(6)),
        ]);
        let merged: Vec<_> = MergeJoin::new(
            vec![MergeSource::new("a", a), MergeSource::new("b", b)],
            None,
            FailurePolicy::Propagate,
        )
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], Record::new(1, GSet::of([1, 2, 3]), Stamp::new(7)));
        assert_eq!(merged[1], Record::new(2, GSet::of([4]), Stamp::new(6)));
        assert_eq!(merged[2], Record::new(3, GSet::of([9]), Stamp::new(5)));
    }

    #[test]
    fn tombstones_shadow_older_states() {
        let records = record_stream(vec![
            Record::new(1, GSet::of([1]), Stamp::new(5)),
            Record::new(2, GSet::of([2]), Stamp::new(9)),
        ]);
        let tombs: EntryStream<i64, GSet<i32>> = Box::new(
            vec![
                Ok(StreamEntry::Tombstone(Tombstone::new(1, Stamp::new(6)))),
                Ok(StreamEntry::Tombstone(Tombstone::new(2, Stamp::new(8)))),
            ]
            .into_iter(),
        );
        let merged: Vec<_> = MergeJoin::new(
            vec![
                MergeSource::new("records", records),
                MergeSource::new("tombs", tombs),
            ],
            None,
            FailurePolicy::Propagate,
        )
        .collect::<Result<_, _>>()
        .unwrap();

        // Key 1 is shadowed (tombstone at 6 covers state at 5); key 2 wrote
        // after its tombstone and survives.
        assert_eq!(merged, vec![Record::new(2, GSet::of([2]), Stamp::new(9))]);
    }

    #[test]
    fn tolerated_failure_keeps_the_merge_alive() {
        let good = record_stream(vec![Record::new(1, GSet::of([1]), Stamp::new(1))]);
        let bad = failing_stream(vec![]);
        let merged: Vec<_> = MergeJoin::new(
            vec![MergeSource::new("good", good), MergeSource::new("bad", bad)],
            None,
            FailurePolicy::Tolerate {
                budget: 1,
                required: 1,
            },
        )
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn exceeding_the_budget_exhausts() {
        let bad = failing_stream(vec![]);
        let results: Vec<_> = MergeJoin::new(
            vec![MergeSource::new("bad", bad)],
            None,
            FailurePolicy::Tolerate {
                budget: 0,
                required: 1,
            },
        )
        .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(StorageError::Exhausted { .. })
        ));
    }

    #[test]
    fn propagate_surfaces_the_source_error() {
        let bad = failing_stream(vec![Record::new(1, GSet::of([1]), Stamp::new(1))]);
        let mut merge = MergeJoin::new(
            vec![MergeSource::new("bad", bad)],
            None,
            FailurePolicy::Propagate,
        );
        assert!(merge.next().unwrap().is_ok());
        assert!(matches!(merge.next(), Some(Err(StorageError::Shutdown))));
        assert!(merge.next().is_none());
    }
}
