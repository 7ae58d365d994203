//! Chunk-file storage: each upload or remove session lands as one key-sorted
//! chunk under the storage root, named by a dense integer id. Downloads merge
//! all chunks on the fly; consolidation rewrites them into one and drops
//! tombstones.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::{
    Crdt, CrdtCodec, Key, Record, Stamp, Tombstone, decode_tombstone, encode_tombstone,
};
use crate::metrics;
use crate::wire::{CompressionMethod, FrameReader, FrameWriter, WireReader, WireWriter};

use super::merge::{EntryStream, FailurePolicy, MergeJoin, MergeSource, StreamEntry};
use super::{CrdtStorage, RecordStream, RemoveSink, StorageError, UploadSink};

const ID_FILE: &str = "ids";
const TAG_RECORD: u8 = 0;
const TAG_TOMBSTONE: u8 = 1;

#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    pub compression: CompressionMethod,
    pub max_frame_bytes: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::None,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ChunkStat {
    records: usize,
    tombstones: usize,
}

#[derive(Debug)]
struct IdSequence {
    path: PathBuf,
    next: u64,
}

impl IdSequence {
    fn open(root: &Path) -> Result<Self, StorageError> {
        let path = root.join(ID_FILE);
        let next = match fs::read_to_string(&path) {
            Ok(contents) => {
                contents
                    .trim()
                    .parse::<u64>()
                    .map_err(|err| StorageError::IdSequenceCorrupt {
                        path: path.clone(),
                        reason: err.to_string(),
                    })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(StorageError::io(&path, err)),
        };
        Ok(Self { path, next })
    }

    fn next_id(&mut self) -> Result<u64, StorageError> {
        let id = self.next;
        self.next += 1;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|err| StorageError::io(&tmp, err))?;
        file.write_all(self.next.to_string().as_bytes())
            .map_err(|err| StorageError::io(&tmp, err))?;
        file.sync_all().map_err(|err| StorageError::io(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::io(&self.path, err))?;
        Ok(id)
    }
}

#[derive(Debug)]
struct Shared<C> {
    root: PathBuf,
    codec: C,
    config: FsConfig,
    chunks: Mutex<BTreeMap<u64, ChunkStat>>,
    ids: Mutex<IdSequence>,
}

impl<C> Shared<C> {
    fn chunk_path(&self, id: u64) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Write the given frame payloads into a fresh chunk: tmp file, fsync,
    /// rename, directory fsync, then register the chunk.
    fn write_chunk(&self, frames: Vec<Vec<u8>>, stat: ChunkStat) -> Result<u64, StorageError> {
        let id = {
            let mut ids = self.ids.lock().unwrap_or_else(|err| err.into_inner());
            ids.next_id()?
        };
        let final_path = self.chunk_path(id);
        let tmp_path = self.root.join(format!("tmp-{id}"));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|err| StorageError::io(&tmp_path, err))?;
        let mut writer = FrameWriter::new(WireWriter::new(file, self.config.compression));
        for frame in &frames {
            writer.write_frame(frame)?;
        }
        let file = writer.into_inner().into_inner()?;
        file.sync_all()
            .map_err(|err| StorageError::io(&tmp_path, err))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|err| StorageError::io(&final_path, err))?;
        fsync_dir(&self.root)?;

        let mut chunks = self.chunks.lock().unwrap_or_else(|err| err.into_inner());
        chunks.insert(id, stat);
        metrics::counter(
            "storage_chunks_written",
            1,
            vec![("entries", frames.len().to_string())],
        );
        Ok(id)
    }
}

fn fsync_dir(dir: &Path) -> Result<(), StorageError> {
    let handle = File::open(dir).map_err(|err| StorageError::io(dir, err))?;
    handle.sync_all().map_err(|err| StorageError::io(dir, err))
}

pub struct FsStorage<K, S, C> {
    shared: Arc<Shared<C>>,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C: fmt::Debug> fmt::Debug for FsStorage<K, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStorage").field("shared", &self.shared).finish()
    }
}

impl<K, S, C> Clone for FsStorage<K, S, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<K, S, C> FsStorage<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    /// Open (or create) a store under `root`, scanning existing chunks.
    pub fn open(root: impl Into<PathBuf>, codec: C, config: FsConfig) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| StorageError::io(&root, err))?;
        let ids = IdSequence::open(&root)?;

        let mut chunks = BTreeMap::new();
        let entries = fs::read_dir(&root).map_err(|err| StorageError::io(&root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| StorageError::io(&root, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("tmp-") {
                // Leftover from a crashed write; the id was burned, the data
                // never committed.
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Ok(id) = name.parse::<u64>() else { continue };
            let stat = scan_chunk(&entry.path(), config)?;
            chunks.insert(id, stat);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                root,
                codec,
                config,
                chunks: Mutex::new(chunks),
                ids: Mutex::new(ids),
            }),
            _marker: PhantomData,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.shared
            .chunks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    fn open_sources(
        &self,
        ids: &[u64],
    ) -> Result<Vec<MergeSource<K, S>>, StorageError> {
        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.shared.chunk_path(*id);
            let file = File::open(&path).map_err(|err| StorageError::io(&path, err))?;
            let reader = FrameReader::new(
                WireReader::new(BufReader::new(file), self.shared.config.compression),
                self.shared.config.max_frame_bytes,
            );
            let stream: EntryStream<K, S> = Box::new(ChunkIter {
                reader,
                codec: self.shared.codec.clone(),
                _marker: PhantomData,
            });
            sources.push(MergeSource::new(format!("chunk-{id}"), stream));
        }
        Ok(sources)
    }

    fn merged(
        &self,
        ids: &[u64],
        since: Option<Stamp>,
    ) -> Result<MergeJoin<K, S>, StorageError> {
        let sources = self.open_sources(ids)?;
        Ok(MergeJoin::new(sources, since, FailurePolicy::Propagate))
    }

    /// Merge every chunk into one, dropping tombstones and the keys they
    /// fully shadow. Chunks written concurrently are left alone.
    pub fn consolidate(&self) -> Result<(), StorageError> {
        let ids: Vec<u64> = {
            let chunks = self
                .shared
                .chunks
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            chunks.keys().copied().collect()
        };
        if ids.len() <= 1 {
            return Ok(());
        }

        let mut frames = Vec::new();
        let mut stat = ChunkStat::default();
        for record in self.merged(&ids, None)? {
            let record = record?;
            frames.push(encode_record_entry(&self.shared.codec, &record)?);
            stat.records += 1;
        }

        if !frames.is_empty() {
            self.shared.write_chunk(frames, stat)?;
        }
        let mut chunks = self
            .shared
            .chunks
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        for id in &ids {
            chunks.remove(id);
            let _ = fs::remove_file(self.shared.chunk_path(*id));
        }
        drop(chunks);
        metrics::counter("storage_chunks_consolidated", ids.len() as u64, Vec::new());
        Ok(())
    }
}

fn encode_record_entry<K, S, C: CrdtCodec<K, S>>(
    codec: &C,
    record: &Record<K, S>,
) -> Result<Vec<u8>, StorageError> {
    let body = codec.encode_record(record)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(TAG_RECORD);
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn encode_tombstone_entry<K, S, C: CrdtCodec<K, S>>(
    codec: &C,
    tombstone: &Tombstone<K>,
) -> Result<Vec<u8>, StorageError> {
    let body = encode_tombstone::<K, S, C>(codec, tombstone)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(TAG_TOMBSTONE);
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn scan_chunk(path: &Path, config: FsConfig) -> Result<ChunkStat, StorageError> {
    let file = File::open(path).map_err(|err| StorageError::io(path, err))?;
    let mut reader = FrameReader::new(
        WireReader::new(BufReader::new(file), config.compression),
        config.max_frame_bytes,
    );
    let mut stat = ChunkStat::default();
    while let Some(frame) = reader.read_frame_allow_eof()? {
        match frame.first() {
            Some(&TAG_RECORD) => stat.records += 1,
            Some(&TAG_TOMBSTONE) => stat.tombstones += 1,
            _ => {
                return Err(StorageError::io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "chunk entry has no tag",
                    ),
                ));
            }
        }
    }
    Ok(stat)
}

struct ChunkIter<K, S, C, R: Read> {
    reader: FrameReader<R>,
    codec: C,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C, R> Iterator for ChunkIter<K, S, C, R>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
    R: Read,
{
    type Item = Result<StreamEntry<K, S>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.reader.read_frame_allow_eof() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(err) => return Some(Err(err.into())),
        };
        let Some((&tag, body)) = frame.split_first() else {
            return Some(Err(StorageError::io(
                "chunk",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "empty chunk entry"),
            )));
        };
        let entry = match tag {
            TAG_RECORD => self
                .codec
                .decode_record(body)
                .map(StreamEntry::Record)
                .map_err(StorageError::from),
            TAG_TOMBSTONE => decode_tombstone::<K, S, C>(&self.codec, body)
                .map(StreamEntry::Tombstone)
                .map_err(StorageError::from),
            other => Err(StorageError::io(
                "chunk",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown chunk entry tag {other}"),
                ),
            )),
        };
        Some(entry)
    }
}

impl<K, S, C> CrdtStorage<K, S> for FsStorage<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StorageError> {
        Ok(Box::new(FsUploadSink {
            shared: Arc::clone(&self.shared),
            pending: BTreeMap::new(),
        }))
    }

    fn download(&self, since: Option<Stamp>) -> Result<RecordStream<K, S>, StorageError> {
        let ids: Vec<u64> = {
            let chunks = self
                .shared
                .chunks
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            chunks.keys().copied().collect()
        };
        // Files are opened before returning, so a consolidation that unlinks
        // them later does not disturb this download.
        let merged = self.merged(&ids, since)?;
        Ok(Box::new(merged))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StorageError> {
        Ok(Box::new(FsRemoveSink {
            shared: Arc::clone(&self.shared),
            pending: BTreeMap::new(),
            _marker: PhantomData,
        }))
    }

    fn len(&self) -> Option<usize> {
        let chunks = self
            .shared
            .chunks
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let records: usize = chunks.values().map(|stat| stat.records).sum();
        let tombstones: usize = chunks.values().map(|stat| stat.tombstones).sum();
        Some(records.saturating_sub(tombstones))
    }
}

struct FsUploadSink<K, S, C> {
    shared: Arc<Shared<C>>,
    pending: BTreeMap<K, Record<K, S>>,
}

impl<K, S, C> UploadSink<K, S> for FsUploadSink<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn accept(&mut self, record: Record<K, S>) -> Result<(), StorageError> {
        match self.pending.remove(&record.key) {
            None => {
                self.pending.insert(record.key.clone(), record);
            }
            Some(existing) => {
                self.pending.insert(
                    record.key.clone(),
                    Record::new(
                        record.key,
                        S::join(existing.state, record.state),
                        existing.stamp.max(record.stamp),
                    ),
                );
            }
        }
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::with_capacity(self.pending.len());
        let mut stat = ChunkStat::default();
        for record in self.pending.values() {
            frames.push(encode_record_entry(&self.shared.codec, record)?);
            stat.records += 1;
        }
        self.shared.write_chunk(frames, stat)?;
        Ok(())
    }
}

struct FsRemoveSink<K, S, C> {
    shared: Arc<Shared<C>>,
    pending: BTreeMap<K, Stamp>,
    _marker: PhantomData<fn() -> S>,
}

impl<K, S, C> RemoveSink<K> for FsRemoveSink<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn accept(&mut self, tombstone: Tombstone<K>) -> Result<(), StorageError> {
        let stamp = self
            .pending
            .get(&tombstone.key)
            .map_or(tombstone.stamp, |existing| (*existing).max(tombstone.stamp));
        self.pending.insert(tombstone.key, stamp);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::with_capacity(self.pending.len());
        let mut stat = ChunkStat::default();
        for (key, stamp) in &self.pending {
            let tombstone = Tombstone::new(key.clone(), *stamp);
            frames.push(encode_tombstone_entry::<K, S, C>(
                &self.shared.codec,
                &tombstone,
            )?);
            stat.tombstones += 1;
        }
        self.shared.write_chunk(frames, stat)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GSet, JsonCodec};
    use tempfile::TempDir;

    type Store = FsStorage<i64, GSet<i32>, JsonCodec>;

    fn open(dir: &TempDir, compression: CompressionMethod) -> Store {
        FsStorage::open(
            dir.path(),
            JsonCodec,
            FsConfig {
                compression,
                ..FsConfig::default()
            },
        )
        .unwrap()
    }

    fn upload(store: &Store, records: Vec<Record<i64, GSet<i32>>>) {
        let mut sink = store.upload().unwrap();
        for record in records {
            sink.accept(record).unwrap();
        }
        sink.complete().unwrap();
    }

    fn download(store: &Store) -> Vec<Record<i64, GSet<i32>>> {
        store
            .download(None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn chunks_merge_across_sessions() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, CompressionMethod::None);
        upload(
            &store,
            vec![
                Record::new(1, GSet::of([1, 2, 3]), Stamp::new(1)),
                Record::new(2, GSet::of([-12, 0, 200]), Stamp::new(1)),
            ],
        );
        upload(&store, vec![Record::new(1, GSet::of([9, 10, 11]), Stamp::new(2))]);

        let records = download(&store);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, GSet::of([1, 2, 3, 9, 10, 11]));
        assert_eq!(store.chunk_count(), 2);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir, CompressionMethod::Lz4);
            upload(&store, vec![Record::new(5, GSet::of([50]), Stamp::new(3))]);
        }
        let store = open(&dir, CompressionMethod::Lz4);
        let records = download(&store);
        assert_eq!(records, vec![Record::new(5, GSet::of([50]), Stamp::new(3))]);
    }

    #[test]
    fn consolidate_folds_and_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, CompressionMethod::None);
        upload(
            &store,
            vec![
                Record::new(1, GSet::of([1]), Stamp::new(1)),
                Record::new(2, GSet::of([2]), Stamp::new(1)),
            ],
        );
        upload(&store, vec![Record::new(1, GSet::of([7]), Stamp::new(2))]);

        let mut sink = store.remove().unwrap();
        sink.accept(Tombstone::new(2, Stamp::new(3))).unwrap();
        sink.complete().unwrap();
        assert_eq!(store.chunk_count(), 3);

        store.consolidate().unwrap();
        assert_eq!(store.chunk_count(), 1);
        let records = download(&store);
        assert_eq!(records, vec![Record::new(1, GSet::of([1, 7]), Stamp::new(2))]);
    }

    #[test]
    fn chunk_ids_are_dense_and_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir, CompressionMethod::None);
            upload(&store, vec![Record::new(1, GSet::of([1]), Stamp::new(1))]);
            upload(&store, vec![Record::new(2, GSet::of([2]), Stamp::new(1))]);
        }
        assert!(dir.path().join("0").exists());
        assert!(dir.path().join("1").exists());

        let store = open(&dir, CompressionMethod::None);
        upload(&store, vec![Record::new(3, GSet::of([3]), Stamp::new(1))]);
        assert!(dir.path().join("2").exists());
    }

    #[test]
    fn corrupt_id_sequence_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(ID_FILE), "not-a-number").unwrap();
        let err = Store::open(dir.path(), JsonCodec, FsConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::IdSequenceCorrupt { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn empty_sessions_write_no_chunk() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, CompressionMethod::None);
        let sink = store.upload().unwrap();
        sink.complete().unwrap();
        assert_eq!(store.chunk_count(), 0);
    }
}
