//! Segment files: `<node>_<seq>.wal` while open, `<node>_<seq>.wal.final`
//! once sealed. The body is a plain record-frame stream with no trailing
//! terminator; the name carries everything recovery needs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::NodeId;
use crate::wire::frame::write_uvarint;

use super::WalError;

pub const OPEN_SUFFIX: &str = ".wal";
pub const SEALED_SUFFIX: &str = ".wal.final";

pub fn open_segment_name(node: &NodeId, seq: u64) -> String {
    format!("{}_{}{}", node, seq, OPEN_SUFFIX)
}

pub fn sealed_segment_name(node: &NodeId, seq: u64) -> String {
    format!("{}_{}{}", node, seq, SEALED_SUFFIX)
}

/// Parse a segment file name into `(node, seq, sealed)`. Node ids may contain
/// underscores; the sequence is whatever follows the last one.
pub fn parse_segment_name(name: &str) -> Option<(NodeId, u64, bool)> {
    let (stem, sealed) = match name.strip_suffix(SEALED_SUFFIX) {
        Some(stem) => (stem, true),
        None => (name.strip_suffix(OPEN_SUFFIX)?, false),
    };
    let (node, seq) = stem.rsplit_once('_')?;
    if node.is_empty() {
        return None;
    }
    let seq = seq.parse::<u64>().ok()?;
    Some((NodeId::new(node), seq, sealed))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedSegment {
    pub seq: u64,
    pub path: PathBuf,
}

pub struct SegmentWriter {
    dir: PathBuf,
    node: NodeId,
    seq: u64,
    file: File,
    path: PathBuf,
    bytes: u64,
    opened_at: Instant,
    fsync: bool,
}

impl SegmentWriter {
    pub fn create(dir: &Path, node: &NodeId, seq: u64, fsync: bool) -> Result<Self, WalError> {
        let path = dir.join(open_segment_name(node, seq));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| WalError::io(&path, err))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            node: node.clone(),
            seq,
            file,
            path,
            bytes: 0,
            opened_at: Instant::now(),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn would_exceed(&self, next_payload_len: usize, max_bytes: u64) -> bool {
        if max_bytes == 0 || self.bytes == 0 {
            return false;
        }
        // Varint prefix is at most 10 bytes; close enough for a threshold.
        self.bytes + next_payload_len as u64 + 10 > max_bytes
    }

    /// Append one record frame. Returns once the bytes are in the OS write
    /// buffer; fsyncs too when the log is configured for it.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), WalError> {
        let mut frame = Vec::with_capacity(payload.len() + 10);
        write_uvarint(&mut frame, payload.len() as u64)?;
        frame.extend_from_slice(payload);
        self.file
            .write_all(&frame)
            .map_err(|err| WalError::io(&self.path, err))?;
        if self.fsync {
            self.file
                .sync_data()
                .map_err(|err| WalError::io(&self.path, err))?;
        }
        self.bytes += frame.len() as u64;
        Ok(())
    }

    /// Make the segment durable and rename it to its terminal suffix.
    pub fn seal(self) -> Result<SealedSegment, WalError> {
        self.file
            .sync_all()
            .map_err(|err| WalError::io(&self.path, err))?;
        drop(self.file);
        let sealed_path = self.dir.join(sealed_segment_name(&self.node, self.seq));
        std::fs::rename(&self.path, &sealed_path)
            .map_err(|err| WalError::io(&sealed_path, err))?;
        fsync_dir(&self.dir)?;
        Ok(SealedSegment {
            seq: self.seq,
            path: sealed_path,
        })
    }
}

pub(crate) fn fsync_dir(dir: &Path) -> Result<(), WalError> {
    let handle = File::open(dir).map_err(|err| WalError::io(dir, err))?;
    handle.sync_all().map_err(|err| WalError::io(dir, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_round_trip() {
        let node = NodeId::new("store_a");
        assert_eq!(open_segment_name(&node, 3), "store_a_3.wal");
        assert_eq!(sealed_segment_name(&node, 3), "store_a_3.wal.final");
        assert_eq!(
            parse_segment_name("store_a_3.wal"),
            Some((node.clone(), 3, false))
        );
        assert_eq!(
            parse_segment_name("store_a_3.wal.final"),
            Some((node, 3, true))
        );
        assert_eq!(parse_segment_name("garbage.txt"), None);
        assert_eq!(parse_segment_name("noseq.wal"), None);
    }

    #[test]
    fn seal_renames_and_keeps_bytes() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let mut writer = SegmentWriter::create(dir.path(), &node, 1, false).unwrap();
        writer.append(b"hello").unwrap();
        assert!(!writer.is_empty());
        let open_path = writer.path().to_path_buf();
        assert!(open_path.exists());

        let sealed = writer.seal().unwrap();
        assert!(!open_path.exists());
        assert!(sealed.path.exists());
        assert!(sealed.path.to_string_lossy().ends_with(".wal.final"));
        let contents = std::fs::read(&sealed.path).unwrap();
        // 1-byte varint length plus the payload.
        assert_eq!(contents, [&[5u8][..], b"hello"].concat());
    }

    #[test]
    fn size_threshold_accounts_for_pending_payload() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let mut writer = SegmentWriter::create(dir.path(), &node, 1, false).unwrap();
        writer.append(&[0u8; 100]).unwrap();
        assert!(!writer.would_exceed(10, 0));
        assert!(writer.would_exceed(100, 150));
        assert!(!writer.would_exceed(10, 1024));
    }

    #[test]
    fn create_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::new("n1");
        let _writer = SegmentWriter::create(dir.path(), &node, 1, false).unwrap();
        assert!(SegmentWriter::create(dir.path(), &node, 1, false).is_err());
    }
}
