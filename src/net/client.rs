//! Remote storage: the storage interface spoken over a pooled TCP
//! connection. An upload or remove that does not observe the end-of-stream
//! acknowledgement is a failed session, whatever the socket said before.

use std::marker::PhantomData;
use std::net::TcpStream;
use std::sync::Arc;

use crate::core::{Crdt, CrdtCodec, Key, Record, Stamp, Tombstone, encode_tombstone};
use crate::storage::{CrdtStorage, RecordStream, RemoveSink, StorageError, UploadSink};
use crate::wire::command::{read_ack, read_command, write_command};
use crate::wire::{Command, CompressionMethod, FrameReader, FrameWriter, WireReader, WireWriter};

use super::pool::{ConnectionPool, PooledStream};

pub struct RemoteStorage<K, S, C> {
    endpoint: String,
    pool: Arc<ConnectionPool>,
    codec: C,
    compression: CompressionMethod,
    max_frame_bytes: usize,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C: Clone> Clone for RemoteStorage<K, S, C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            pool: Arc::clone(&self.pool),
            codec: self.codec.clone(),
            compression: self.compression,
            max_frame_bytes: self.max_frame_bytes,
            _marker: PhantomData,
        }
    }
}

impl<K, S, C> RemoteStorage<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    pub fn new(
        endpoint: impl Into<String>,
        pool: Arc<ConnectionPool>,
        codec: C,
        compression: CompressionMethod,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool,
            codec,
            compression,
            max_frame_bytes,
            _marker: PhantomData,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&self, command: &Command) -> Result<PooledStream, StorageError> {
        let mut conn = self.pool.check_out(&self.endpoint)?;
        match write_command(&mut conn.stream, command) {
            Ok(()) => Ok(conn),
            Err(err) => {
                drop(conn);
                self.pool.release_broken();
                Err(err.into())
            }
        }
    }
}

impl<K, S, C> CrdtStorage<K, S> for RemoteStorage<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StorageError> {
        let conn = self.open(&Command::Upload {
            compressed: self.compression != CompressionMethod::None,
        })?;
        Ok(Box::new(RemoteUploadSink {
            endpoint: self.endpoint.clone(),
            pool: Arc::clone(&self.pool),
            codec: self.codec.clone(),
            writer: Some(FrameWriter::new(WireWriter::new(
                conn.stream,
                self.compression,
            ))),
            _marker: PhantomData,
        }))
    }

    fn download(&self, since: Option<Stamp>) -> Result<RecordStream<K, S>, StorageError> {
        let conn = self.open(&Command::Download {
            since: since.map(Stamp::get),
            compressed: self.compression != CompressionMethod::None,
        })?;
        Ok(Box::new(RemoteDownloadStream {
            endpoint: self.endpoint.clone(),
            pool: Arc::clone(&self.pool),
            codec: self.codec.clone(),
            reader: Some(FrameReader::new(
                WireReader::new(conn.stream, self.compression),
                self.max_frame_bytes,
            )),
            _marker: PhantomData,
        }))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StorageError> {
        let conn = self.open(&Command::Remove {
            compressed: self.compression != CompressionMethod::None,
        })?;
        Ok(Box::new(RemoteRemoveSink {
            endpoint: self.endpoint.clone(),
            pool: Arc::clone(&self.pool),
            codec: self.codec.clone(),
            writer: Some(FrameWriter::new(WireWriter::new(
                conn.stream,
                self.compression,
            ))),
            _marker: PhantomData,
        }))
    }

    fn probe(&self) -> Result<(), StorageError> {
        let mut conn = self.open(&Command::Ping)?;
        match read_command(&mut conn.stream) {
            Ok(Some(Command::Ok)) => {
                self.pool.check_in(conn);
                Ok(())
            }
            Ok(other) => {
                drop(conn);
                self.pool.release_broken();
                Err(StorageError::Refused {
                    endpoint: self.endpoint.clone(),
                    message: match other {
                        Some(Command::Error { message }) => message,
                        Some(cmd) => format!("unexpected {} reply to ping", cmd.name()),
                        None => "connection closed during ping".to_string(),
                    },
                })
            }
            Err(err) => {
                drop(conn);
                self.pool.release_broken();
                Err(err.into())
            }
        }
    }
}

/// Finish a record stream: terminator frame, flush, then wait for the ack.
fn close_stream(
    writer: FrameWriter<WireWriter<TcpStream>>,
    endpoint: &str,
    pool: &ConnectionPool,
) -> Result<(), StorageError> {
    let mut writer = writer;
    let result = (|| -> Result<TcpStream, StorageError> {
        writer.finish()?;
        Ok(writer.into_inner().into_inner()?)
    })();
    let mut stream = match result {
        Ok(stream) => stream,
        Err(err) => {
            pool.release_broken();
            return Err(err);
        }
    };
    match read_ack(&mut stream) {
        Ok(Ok(())) => {
            pool.check_in(PooledStream {
                endpoint: endpoint.to_string(),
                stream,
            });
            Ok(())
        }
        Ok(Err(message)) => {
            drop(stream);
            pool.release_broken();
            Err(StorageError::Refused {
                endpoint: endpoint.to_string(),
                message,
            })
        }
        Err(err) => {
            drop(stream);
            pool.release_broken();
            Err(err.into())
        }
    }
}

struct RemoteUploadSink<K, S, C> {
    endpoint: String,
    pool: Arc<ConnectionPool>,
    codec: C,
    writer: Option<FrameWriter<WireWriter<TcpStream>>>,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C> UploadSink<K, S> for RemoteUploadSink<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn accept(&mut self, record: Record<K, S>) -> Result<(), StorageError> {
        let payload = self.codec.encode_record(&record)?;
        let writer = self.writer.as_mut().ok_or(StorageError::Shutdown)?;
        if let Err(err) = writer.write_frame(&payload) {
            self.writer = None;
            self.pool.release_broken();
            return Err(err.into());
        }
        Ok(())
    }

    fn complete(mut self: Box<Self>) -> Result<(), StorageError> {
        let writer = self.writer.take().ok_or(StorageError::Shutdown)?;
        close_stream(writer, &self.endpoint, &self.pool)
    }

    fn abort(mut self: Box<Self>) {
        if self.writer.take().is_some() {
            self.pool.release_broken();
        }
    }
}

impl<K, S, C> Drop for RemoteUploadSink<K, S, C> {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            self.pool.release_broken();
        }
    }
}

struct RemoteRemoveSink<K, S, C> {
    endpoint: String,
    pool: Arc<ConnectionPool>,
    codec: C,
    writer: Option<FrameWriter<WireWriter<TcpStream>>>,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C> RemoveSink<K> for RemoteRemoveSink<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn accept(&mut self, tombstone: Tombstone<K>) -> Result<(), StorageError> {
        let payload = encode_tombstone::<K, S, C>(&self.codec, &tombstone)?;
        let writer = self.writer.as_mut().ok_or(StorageError::Shutdown)?;
        if let Err(err) = writer.write_frame(&payload) {
            self.writer = None;
            self.pool.release_broken();
            return Err(err.into());
        }
        Ok(())
    }

    fn complete(mut self: Box<Self>) -> Result<(), StorageError> {
        let writer = self.writer.take().ok_or(StorageError::Shutdown)?;
        close_stream(writer, &self.endpoint, &self.pool)
    }

    fn abort(mut self: Box<Self>) {
        if self.writer.take().is_some() {
            self.pool.release_broken();
        }
    }
}

impl<K, S, C> Drop for RemoteRemoveSink<K, S, C> {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            self.pool.release_broken();
        }
    }
}

struct RemoteDownloadStream<K, S, C> {
    endpoint: String,
    pool: Arc<ConnectionPool>,
    codec: C,
    reader: Option<FrameReader<WireReader<TcpStream>>>,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S, C> Iterator for RemoteDownloadStream<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    type Item = Result<Record<K, S>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.read_frame() {
            Ok(Some(frame)) => match self.codec.decode_record(&frame) {
                Ok(record) => Some(Ok(record)),
                Err(err) => {
                    self.reader = None;
                    self.pool.release_broken();
                    Some(Err(err.into()))
                }
            },
            Ok(None) => {
                // End of stream: acknowledge it so the sender knows the
                // download landed, then give the connection back.
                let reader = self.reader.take().expect("reader checked above");
                let mut stream = reader.into_inner().into_inner();
                match write_command(&mut stream, &Command::Ok) {
                    Ok(()) => self.pool.check_in(PooledStream {
                        endpoint: self.endpoint.clone(),
                        stream,
                    }),
                    Err(err) => {
                        tracing::debug!(
                            endpoint = %self.endpoint,
                            error = %err,
                            "download ack failed"
                        );
                        drop(stream);
                        self.pool.release_broken();
                    }
                }
                None
            }
            Err(err) => {
                self.reader = None;
                self.pool.release_broken();
                Some(Err(err.into()))
            }
        }
    }
}

impl<K, S, C> Drop for RemoteDownloadStream<K, S, C> {
    fn drop(&mut self) {
        if self.reader.take().is_some() {
            self.pool.release_broken();
        }
    }
}
