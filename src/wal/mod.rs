//! Durable write-ahead log in front of storage.
//!
//! One worker thread owns the open segment; `put`, `flush`, and `stop` are
//! messages with response channels, which gives puts their total order. A
//! sealed segment is handed off to storage as one upload session and unlinked
//! only after the session acks; handoff failures leave the segment in place
//! for the next flush or the next start to retry.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use crate::core::{CodecError, Crdt, CrdtCodec, Key, NodeId, Record, Stamp, stamp_now};
use crate::error::ErrorKind;
use crate::metrics;
use crate::storage::{CrdtStorage, StorageError};
use crate::wire::WireError;

pub mod replay;
pub mod segment;

pub use replay::{RecoveryOutcome, SegmentRecords, read_segment, recover};
pub use segment::{SealedSegment, SegmentWriter, open_segment_name, parse_segment_name};

#[derive(Clone, Copy, Debug)]
pub struct WalConfig {
    pub segment_max_bytes: u64,
    pub rotation_interval_ms: u64,
    pub fsync: bool,
    pub max_frame_bytes: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 16 * 1024 * 1024,
            rotation_interval_ms: 60_000,
            fsync: false,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("segment handoff failed: {0}")]
    Handoff(#[source] StorageError),

    #[error("write-ahead log is shut down")]
    Shutdown,
}

impl WalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::StorageFull => ErrorKind::Fatal,
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    ErrorKind::Malformed
                }
                _ => ErrorKind::Transient,
            },
            WalError::Codec(_) => ErrorKind::Malformed,
            WalError::Wire(err) => err.kind(),
            WalError::Handoff(err) => err.kind(),
            WalError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WalError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

enum WalRequest<K, S> {
    Put {
        key: K,
        state: S,
        respond: Sender<Result<Stamp, WalError>>,
    },
    Flush {
        respond: Sender<Result<(), WalError>>,
    },
    Stop {
        respond: Sender<Result<(), WalError>>,
    },
}

pub struct WriteAheadLog<K, S> {
    tx: Sender<WalRequest<K, S>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<K: Key, S: Crdt> WriteAheadLog<K, S> {
    /// Recover the directory (draining every sealed segment into `storage`),
    /// open a fresh segment, and start accepting puts.
    pub fn start<C>(
        dir: impl Into<PathBuf>,
        node: NodeId,
        config: WalConfig,
        codec: C,
        storage: Arc<dyn CrdtStorage<K, S>>,
    ) -> Result<Self, WalError>
    where
        C: CrdtCodec<K, S>,
    {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| WalError::io(&dir, err))?;

        let outcome = recover(&dir, &node, &codec, storage.as_ref(), config.max_frame_bytes)?;
        if outcome.drained_records > 0 || !outcome.truncated.is_empty() {
            tracing::info!(
                node = %node,
                drained_records = outcome.drained_records,
                drained_segments = outcome.drained_segments,
                truncated = outcome.truncated.len(),
                deleted = outcome.deleted.len(),
                "write-ahead log recovered"
            );
        }

        let writer = SegmentWriter::create(&dir, &node, outcome.next_seq, config.fsync)?;
        let (tx, rx) = unbounded();
        let worker = WalWorker {
            dir,
            node,
            config,
            codec,
            storage,
            writer: Some(writer),
            next_seq: outcome.next_seq + 1,
        };
        let join = std::thread::Builder::new()
            .name("wal".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|err| WalError::Io {
                path: None,
                source: err,
            })?;

        Ok(Self {
            tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Append one record. Resolves once the frame is in the OS write buffer
    /// (and fsynced when configured). Returns the stamp the record carries.
    pub fn put(&self, key: K, state: S) -> Result<Stamp, WalError> {
        let (respond, rx) = unbounded();
        self.tx
            .send(WalRequest::Put {
                key,
                state,
                respond,
            })
            .map_err(|_| WalError::Shutdown)?;
        rx.recv().map_err(|_| WalError::Shutdown)?
    }

    /// Seal the open segment and hand it (plus any previously retained
    /// segments) to storage. Resolves when storage has acked everything.
    pub fn flush(&self) -> Result<(), WalError> {
        let (respond, rx) = unbounded();
        self.tx
            .send(WalRequest::Flush { respond })
            .map_err(|_| WalError::Shutdown)?;
        rx.recv().map_err(|_| WalError::Shutdown)?
    }

    /// Final flush plus refusal of new writes.
    pub fn stop(&self) -> Result<(), WalError> {
        let (respond, rx) = unbounded();
        self.tx
            .send(WalRequest::Stop { respond })
            .map_err(|_| WalError::Shutdown)?;
        let result = rx.recv().map_err(|_| WalError::Shutdown)?;
        if let Some(join) = self.join.lock().unwrap_or_else(|err| err.into_inner()).take() {
            let _ = join.join();
        }
        result
    }
}

impl<K, S> Drop for WriteAheadLog<K, S> {
    fn drop(&mut self) {
        let (respond, rx) = unbounded();
        if self.tx.send(WalRequest::Stop { respond }).is_ok() {
            let _ = rx.recv();
        }
        if let Some(join) = self.join.lock().unwrap_or_else(|err| err.into_inner()).take() {
            let _ = join.join();
        }
    }
}

struct WalWorker<K, S, C> {
    dir: PathBuf,
    node: NodeId,
    config: WalConfig,
    codec: C,
    storage: Arc<dyn CrdtStorage<K, S>>,
    writer: Option<SegmentWriter>,
    next_seq: u64,
}

impl<K, S, C> WalWorker<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn run(mut self, rx: Receiver<WalRequest<K, S>>) {
        let tick = Duration::from_millis(self.config.rotation_interval_ms.clamp(100, 5_000));
        let mut stopping = false;
        while !stopping {
            crossbeam::select! {
                recv(rx) -> msg => match msg {
                    Ok(WalRequest::Put { key, state, respond }) => {
                        let _ = respond.send(self.handle_put(key, state));
                    }
                    Ok(WalRequest::Flush { respond }) => {
                        let _ = respond.send(self.handle_flush());
                    }
                    Ok(WalRequest::Stop { respond }) => {
                        let result = self.handle_stop();
                        let _ = respond.send(result);
                        stopping = true;
                    }
                    Err(_) => {
                        let _ = self.handle_stop();
                        stopping = true;
                    }
                },
                default(tick) => {
                    self.maybe_rotate_by_age();
                }
            }
        }
        // Whatever is still queued can only be failed now.
        while let Ok(msg) = rx.try_recv() {
            match msg {
                WalRequest::Put { respond, .. } => {
                    let _ = respond.send(Err(WalError::Shutdown));
                }
                WalRequest::Flush { respond } | WalRequest::Stop { respond } => {
                    let _ = respond.send(Err(WalError::Shutdown));
                }
            }
        }
    }

    fn open_segment(&mut self) -> Result<(), WalError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let writer = SegmentWriter::create(&self.dir, &self.node, seq, self.config.fsync)?;
        self.writer = Some(writer);
        Ok(())
    }

    fn handle_put(&mut self, key: K, state: S) -> Result<Stamp, WalError> {
        let stamp = stamp_now();
        let record = Record::new(key, state, stamp);
        let frame = self.codec.encode_record(&record)?;

        if self.writer.is_none() {
            self.open_segment()?;
        }
        let rotate = self
            .writer
            .as_ref()
            .is_some_and(|writer| writer.would_exceed(frame.len(), self.config.segment_max_bytes));
        if rotate {
            self.rotate();
        }
        if self.writer.is_none() {
            self.open_segment()?;
        }

        let writer = self.writer.as_mut().expect("segment opened above");
        match writer.append(&frame) {
            Ok(()) => {
                metrics::counter("wal_records_appended", 1, Vec::new());
                Ok(stamp)
            }
            Err(err) => {
                // Seal whatever made it to disk; the next put starts fresh.
                self.seal_current();
                Err(err)
            }
        }
    }

    /// Seal the current segment and drain every sealed segment of this node.
    fn handle_flush(&mut self) -> Result<(), WalError> {
        self.seal_current();
        let result = self.drain_sealed();
        if let Err(err) = self.open_segment() {
            tracing::error!(error = %err, "wal could not reopen after flush");
            return Err(err);
        }
        result
    }

    fn handle_stop(&mut self) -> Result<(), WalError> {
        self.seal_current();
        self.drain_sealed()
    }

    fn maybe_rotate_by_age(&mut self) {
        let due = self.writer.as_ref().is_some_and(|writer| {
            !writer.is_empty()
                && writer.age() >= Duration::from_millis(self.config.rotation_interval_ms)
        });
        if due {
            self.rotate();
        }
    }

    /// Seal + drain + reopen; drain failures only log, the sealed file stays
    /// behind for a later retry.
    fn rotate(&mut self) {
        self.seal_current();
        if let Err(err) = self.drain_sealed() {
            tracing::warn!(error = %err, "segment handoff failed; sealed segment retained");
        }
        if let Err(err) = self.open_segment() {
            tracing::error!(error = %err, "wal could not reopen after rotation");
        }
    }

    fn seal_current(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        if writer.is_empty() {
            // Nothing in it; drop the file rather than shipping an empty
            // segment.
            let path = writer.path().to_path_buf();
            drop(writer);
            let _ = std::fs::remove_file(path);
            return;
        }
        match writer.seal() {
            Ok(sealed) => {
                metrics::counter(
                    "wal_segments_sealed",
                    1,
                    vec![("seq", sealed.seq.to_string())],
                );
            }
            Err(err) => {
                tracing::error!(error = %err, "sealing segment failed");
            }
        }
    }

    fn drain_sealed(&mut self) -> Result<(), WalError> {
        let sealed = replay::sealed_segments(&self.dir, &self.node)?;
        let mut first_error = None;
        for (seq, path) in sealed {
            match replay::drain_segment(
                &path,
                &self.codec,
                self.storage.as_ref(),
                self.config.max_frame_bytes,
            ) {
                Ok(records) => {
                    tracing::debug!(seq, records, path = %path.display(), "segment drained");
                }
                Err(err) => {
                    tracing::warn!(seq, error = %err, "segment retained after failed handoff");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
