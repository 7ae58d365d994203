//! Startup recovery and segment handoff.
//!
//! On start the directory is scanned: open segments are renamed to sealed,
//! each sealed segment is read up to its last valid frame boundary (a
//! malformed tail is dropped with a warning), drained into storage as one
//! upload session, and unlinked only after the session acks. Empty and
//! fully-malformed files are deleted.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{Crdt, CrdtCodec, Key, NodeId, Record};
use crate::storage::CrdtStorage;
use crate::wire::frame::parse_frame;

use super::segment::{fsync_dir, parse_segment_name, sealed_segment_name};
use super::WalError;

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub drained_records: usize,
    pub drained_segments: usize,
    /// Segments whose malformed tail was dropped.
    pub truncated: Vec<PathBuf>,
    /// Empty or fully-malformed segments that were removed unread.
    pub deleted: Vec<PathBuf>,
    /// Segments kept behind after a failed handoff.
    pub retained: Vec<PathBuf>,
    /// First sequence number that is safe for new segments.
    pub next_seq: u64,
}

pub struct SegmentRecords<K, S> {
    pub records: Vec<Record<K, S>>,
    /// Byte offset the tail was cut at, when the file was malformed.
    pub truncated_at: Option<u64>,
}

/// Read a segment up to the last valid frame boundary. Framing or codec
/// failures stop the scan; everything before the failure survives.
pub fn read_segment<K, S, C>(
    path: &Path,
    codec: &C,
    max_frame_bytes: usize,
) -> Result<SegmentRecords<K, S>, WalError>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    let buf = fs::read(path).map_err(|err| WalError::io(path, err))?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut truncated_at = None;

    loop {
        let before = offset;
        match parse_frame(&buf, &mut offset) {
            Ok(Some(payload)) => {
                if payload.len() > max_frame_bytes {
                    truncated_at = Some(before as u64);
                    break;
                }
                match codec.decode_record(payload) {
                    Ok(record) => records.push(record),
                    Err(_) => {
                        truncated_at = Some(before as u64);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                truncated_at = Some(before as u64);
                break;
            }
        }
    }

    Ok(SegmentRecords {
        records,
        truncated_at,
    })
}

/// List this node's sealed segments, ordered by sequence.
pub(crate) fn sealed_segments(
    dir: &Path,
    node: &NodeId,
) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut sealed = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| WalError::io(dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| WalError::io(dir, err))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((owner, seq, is_sealed)) = parse_segment_name(name) else {
            continue;
        };
        if owner == *node && is_sealed {
            sealed.push((seq, entry.path()));
        }
    }
    sealed.sort_by_key(|(seq, _)| *seq);
    Ok(sealed)
}

/// Stream one sealed segment into storage and unlink it after the ack.
/// Returns how many records were delivered.
pub(crate) fn drain_segment<K, S, C>(
    path: &Path,
    codec: &C,
    storage: &dyn CrdtStorage<K, S>,
    max_frame_bytes: usize,
) -> Result<usize, WalError>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    let scanned = read_segment(path, codec, max_frame_bytes)?;
    if let Some(offset) = scanned.truncated_at {
        tracing::warn!(
            path = %path.display(),
            offset,
            surviving = scanned.records.len(),
            "malformed segment tail dropped"
        );
    }
    if scanned.records.is_empty() {
        fs::remove_file(path).map_err(|err| WalError::io(path, err))?;
        return Ok(0);
    }

    let count = scanned.records.len();
    upload_records(storage, scanned.records)?;
    fs::remove_file(path).map_err(|err| WalError::io(path, err))?;
    Ok(count)
}

fn upload_records<K, S>(
    storage: &dyn CrdtStorage<K, S>,
    records: Vec<Record<K, S>>,
) -> Result<(), WalError> {
    let mut sink = storage.upload().map_err(WalError::Handoff)?;
    for record in records {
        if let Err(err) = sink.accept(record) {
            sink.abort();
            return Err(WalError::Handoff(err));
        }
    }
    sink.complete().map_err(WalError::Handoff)
}

/// Full startup pass over a WAL directory.
pub fn recover<K, S, C>(
    dir: &Path,
    node: &NodeId,
    codec: &C,
    storage: &dyn CrdtStorage<K, S>,
    max_frame_bytes: usize,
) -> Result<RecoveryOutcome, WalError>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    let mut outcome = RecoveryOutcome::default();
    let mut sealed = Vec::new();
    let mut renamed_any = false;

    let entries = fs::read_dir(dir).map_err(|err| WalError::io(dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| WalError::io(dir, err))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((owner, seq, is_sealed)) = parse_segment_name(name) else {
            continue;
        };
        if owner != *node {
            continue;
        }
        outcome.next_seq = outcome.next_seq.max(seq + 1);
        let path = if is_sealed {
            entry.path()
        } else {
            // An open segment at startup means the previous process died
            // with it; seal it and treat it like any other.
            let sealed_path = dir.join(sealed_segment_name(node, seq));
            fs::rename(entry.path(), &sealed_path)
                .map_err(|err| WalError::io(&sealed_path, err))?;
            renamed_any = true;
            sealed_path
        };
        sealed.push((seq, path));
    }
    if renamed_any {
        fsync_dir(dir)?;
    }
    sealed.sort_by_key(|(seq, _)| *seq);

    for (_, path) in sealed {
        let scanned = read_segment::<K, S, C>(&path, codec, max_frame_bytes)?;
        if let Some(offset) = scanned.truncated_at {
            tracing::warn!(
                path = %path.display(),
                offset,
                surviving = scanned.records.len(),
                "malformed segment tail dropped"
            );
            outcome.truncated.push(path.clone());
        }
        if scanned.records.is_empty() {
            fs::remove_file(&path).map_err(|err| WalError::io(&path, err))?;
            outcome.deleted.push(path);
            continue;
        }
        let count = scanned.records.len();
        match upload_records(storage, scanned.records) {
            Ok(()) => {
                fs::remove_file(&path).map_err(|err| WalError::io(&path, err))?;
                outcome.drained_records += count;
                outcome.drained_segments += 1;
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "segment retained after failed recovery handoff"
                );
                outcome.retained.push(path);
            }
        }
    }
    if outcome.next_seq == 0 {
        outcome.next_seq = 1;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GSet, JsonCodec, NodeId, Stamp};
    use crate::storage::{CrdtStorage, MapStorage};
    use crate::wire::frame::write_uvarint;
    use std::sync::Arc;
    use tempfile::TempDir;

    const MAX: usize = 1024 * 1024;

    fn frame_for(record: &Record<i64, GSet<i32>>) -> Vec<u8> {
        use crate::core::CrdtCodec;
        let payload = JsonCodec.encode_record(record).unwrap();
        let mut frame = Vec::new();
        write_uvarint(&mut frame, payload.len() as u64).unwrap();
        frame.extend_from_slice(&payload);
        frame
    }

    fn write_sealed(dir: &Path, node: &NodeId, seq: u64, records: &[Record<i64, GSet<i32>>]) {
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&frame_for(record));
        }
        fs::write(dir.join(sealed_segment_name(node, seq)), buf).unwrap();
    }

    fn download(storage: &MapStorage<i64, GSet<i32>>) -> Vec<Record<i64, GSet<i32>>> {
        storage
            .download(None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn sealed_segments_drain_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        write_sealed(
            dir.path(),
            &node,
            2,
            &[Record::new(1, GSet::of([9, 10, 11]), Stamp::new(4))],
        );
        write_sealed(
            dir.path(),
            &node,
            1,
            &[
                Record::new(1, GSet::of([1, 2, 3]), Stamp::new(1)),
                Record::new(2, GSet::of([-12, 0, 200]), Stamp::new(2)),
            ],
        );

        let storage = Arc::new(MapStorage::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.drained_records, 3);
        assert_eq!(outcome.drained_segments, 2);
        assert_eq!(outcome.next_seq, 3);

        let records = download(&storage);
        assert_eq!(records[0].state, GSet::of([1, 2, 3, 9, 10, 11]));
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn open_segment_is_sealed_and_drained() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let record = Record::new(1, GSet::of([5]), Stamp::new(1));
        fs::write(
            dir.path().join(super::super::segment::open_segment_name(&node, 4)),
            frame_for(&record),
        )
        .unwrap();

        let storage = Arc::new(MapStorage::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.drained_records, 1);
        assert_eq!(outcome.next_seq, 5);
        assert_eq!(download(&storage).len(), 1);
    }

    #[test]
    fn malformed_tail_keeps_the_valid_prefix() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let records: Vec<_> = (0..4)
            .map(|i| Record::new(i, GSet::of([i as i32]), Stamp::new(i as u64 + 1)))
            .collect();
        let mut buf = Vec::new();
        let mut boundaries = Vec::new();
        for record in &records {
            buf.extend_from_slice(&frame_for(record));
            boundaries.push(buf.len());
        }
        // Cut a few bytes into the final frame.
        let cut = boundaries[2] + 3;
        buf.truncate(cut);
        let surviving = boundaries.iter().filter(|end| **end <= cut).count();
        assert_eq!(surviving, 3);
        fs::write(dir.path().join(sealed_segment_name(&node, 1)), buf).unwrap();

        let storage = Arc::new(MapStorage::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.truncated.len(), 1);
        assert_eq!(outcome.drained_records, surviving);
        assert_eq!(download(&storage).len(), surviving);
    }

    #[test]
    fn empty_and_garbage_segments_are_deleted() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        fs::write(dir.path().join(sealed_segment_name(&node, 1)), b"").unwrap();
        fs::write(
            dir.path().join(sealed_segment_name(&node, 2)),
            [0xffu8; 32],
        )
        .unwrap();

        let storage: Arc<MapStorage<i64, GSet<i32>>> = Arc::new(MapStorage::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.deleted.len(), 2);
        assert_eq!(outcome.drained_records, 0);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn foreign_segments_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let other = NodeId::new("n2");
        write_sealed(
            dir.path(),
            &other,
            1,
            &[Record::new(1, GSet::of([1]), Stamp::new(1))],
        );

        let storage: Arc<MapStorage<i64, GSet<i32>>> = Arc::new(MapStorage::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.drained_records, 0);
        assert!(dir
            .path()
            .join(sealed_segment_name(&other, 1))
            .exists());
    }

    #[test]
    fn failed_handoff_retains_the_segment() {
        struct RefusingStorage;
        impl CrdtStorage<i64, GSet<i32>> for RefusingStorage {
            fn upload(
                &self,
            ) -> Result<Box<dyn crate::storage::UploadSink<i64, GSet<i32>>>, crate::storage::StorageError>
            {
                Err(crate::storage::StorageError::Shutdown)
            }
            fn download(
                &self,
                _since: Option<Stamp>,
            ) -> Result<crate::storage::RecordStream<i64, GSet<i32>>, crate::storage::StorageError>
            {
                Ok(Box::new(std::iter::empty()))
            }
            fn remove(
                &self,
            ) -> Result<Box<dyn crate::storage::RemoveSink<i64>>, crate::storage::StorageError>
            {
                Err(crate::storage::StorageError::Shutdown)
            }
        }

        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        write_sealed(
            dir.path(),
            &node,
            1,
            &[Record::new(1, GSet::of([1]), Stamp::new(1))],
        );

        let outcome =
            recover(dir.path(), &node, &JsonCodec, &RefusingStorage, MAX).unwrap();
        assert_eq!(outcome.retained.len(), 1);
        assert!(dir.path().join(sealed_segment_name(&node, 1)).exists());

        // A later recovery against working storage picks the segment up.
        let storage = Arc::new(MapStorage::<i64, GSet<i32>>::new());
        let outcome =
            recover(dir.path(), &node, &JsonCodec, storage.as_ref(), MAX).unwrap();
        assert_eq!(outcome.drained_records, 1);
    }
}
