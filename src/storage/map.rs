//! In-memory storage: a key-ordered map of joined states and tombstones.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::{Crdt, Key, Record, Stamp, Tombstone};
use crate::metrics;

use super::{CrdtStorage, RecordStream, RemoveSink, StorageError, UploadSink};

#[derive(Clone, Debug)]
enum Slot<S> {
    Live { state: S, stamp: Stamp },
    Removed { stamp: Stamp },
}

pub struct MapStorage<K, S> {
    slots: Arc<Mutex<BTreeMap<K, Slot<S>>>>,
}

impl<K, S> Default for MapStorage<K, S> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl<K: Key, S: Crdt> MapStorage<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys, counting tombstoned entries out.
    pub fn live_len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    fn apply_record(slots: &mut BTreeMap<K, Slot<S>>, record: Record<K, S>) {
        match slots.remove(&record.key) {
            None => {
                slots.insert(
                    record.key,
                    Slot::Live {
                        state: record.state,
                        stamp: record.stamp,
                    },
                );
            }
            Some(Slot::Live { state, stamp }) => {
                slots.insert(
                    record.key,
                    Slot::Live {
                        state: S::join(state, record.state),
                        stamp: stamp.max(record.stamp),
                    },
                );
            }
            Some(Slot::Removed { stamp }) => {
                // A write newer than the tombstone resurrects the key.
                let slot = if record.stamp > stamp {
                    Slot::Live {
                        state: record.state,
                        stamp: record.stamp,
                    }
                } else {
                    Slot::Removed { stamp }
                };
                slots.insert(record.key, slot);
            }
        }
    }

    fn apply_tombstone(slots: &mut BTreeMap<K, Slot<S>>, tombstone: Tombstone<K>) {
        match slots.remove(&tombstone.key) {
            None => {
                slots.insert(
                    tombstone.key,
                    Slot::Removed {
                        stamp: tombstone.stamp,
                    },
                );
            }
            Some(Slot::Live { state, stamp }) => {
                let slot = if tombstone.stamp >= stamp {
                    Slot::Removed {
                        stamp: tombstone.stamp,
                    }
                } else {
                    Slot::Live { state, stamp }
                };
                slots.insert(tombstone.key, slot);
            }
            Some(Slot::Removed { stamp }) => {
                slots.insert(
                    tombstone.key,
                    Slot::Removed {
                        stamp: stamp.max(tombstone.stamp),
                    },
                );
            }
        }
    }
}

impl<K: Key, S: Crdt> CrdtStorage<K, S> for MapStorage<K, S> {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StorageError> {
        Ok(Box::new(MapUploadSink {
            slots: Arc::clone(&self.slots),
            pending: Vec::new(),
        }))
    }

    fn download(&self, since: Option<Stamp>) -> Result<RecordStream<K, S>, StorageError> {
        // Snapshot under the lock: a download observes either none or all of
        // any concurrent upload, and nothing installed after it started.
        let snapshot: Vec<(K, Slot<S>)> = {
            let slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
            slots
                .iter()
                .map(|(key, slot)| (key.clone(), slot.clone()))
                .collect()
        };
        let stream = snapshot.into_iter().filter_map(move |(key, slot)| {
            let Slot::Live { state, stamp } = slot else {
                return None;
            };
            let visible = state.extract(since)?;
            Some(Ok(Record::new(key, visible, stamp)))
        });
        Ok(Box::new(stream))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StorageError> {
        Ok(Box::new(MapRemoveSink {
            slots: Arc::clone(&self.slots),
            pending: Vec::new(),
        }))
    }

    fn len(&self) -> Option<usize> {
        Some(self.live_len())
    }
}

struct MapUploadSink<K, S> {
    slots: Arc<Mutex<BTreeMap<K, Slot<S>>>>,
    pending: Vec<Record<K, S>>,
}

impl<K: Key, S: Crdt> UploadSink<K, S> for MapUploadSink<K, S> {
    fn accept(&mut self, record: Record<K, S>) -> Result<(), StorageError> {
        self.pending.push(record);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        let count = self.pending.len() as u64;
        let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        for record in self.pending {
            MapStorage::apply_record(&mut slots, record);
        }
        drop(slots);
        metrics::counter("storage_records_installed", count, Vec::new());
        Ok(())
    }
}

struct MapRemoveSink<K, S> {
    slots: Arc<Mutex<BTreeMap<K, Slot<S>>>>,
    pending: Vec<Tombstone<K>>,
}

impl<K: Key, S: Crdt> RemoveSink<K> for MapRemoveSink<K, S> {
    fn accept(&mut self, tombstone: Tombstone<K>) -> Result<(), StorageError> {
        self.pending.push(tombstone);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        for tombstone in self.pending {
            MapStorage::apply_tombstone(&mut slots, tombstone);
        }
        Ok(())
    }
}
