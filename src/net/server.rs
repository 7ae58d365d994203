//! Storage server: an accept loop and one session thread per connection.
//!
//! A session is a loop of command envelopes. Record streams are applied to
//! the backing storage and answered with `ok` or `error` after the
//! terminator frame; a malformed stream tears the connection down.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::{CancelToken, Crdt, CrdtCodec, Key, Stamp, decode_tombstone};
use crate::metrics;
use crate::storage::{CrdtStorage, StorageError};
use crate::wire::command::{read_command, write_command};
use crate::wire::{Command, CompressionMethod, FrameReader, FrameWriter, WireError, WireReader, WireWriter};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_frame_bytes: usize,
    /// Timeout for reads and writes inside a session.
    pub io_timeout: Duration,
    /// How long an idle session may sit between commands. Longer than the
    /// client keep-alive so pooled connections expire on the client first.
    pub idle_timeout: Duration,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
            io_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_connections: 64,
        }
    }
}

pub struct StorageServer<K, S, C> {
    storage: Arc<dyn CrdtStorage<K, S>>,
    codec: C,
    config: ServerConfig,
}

pub struct ServerHandle {
    cancel: CancelToken,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop accepting connections and join the accept loop. In-flight
    /// sessions observe the cancel token at their next frame.
    pub fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.join();
    }
}

impl<K, S, C> StorageServer<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    pub fn new(storage: Arc<dyn CrdtStorage<K, S>>, codec: C, config: ServerConfig) -> Self {
        Self {
            storage,
            codec,
            config,
        }
    }

    pub fn start(self) -> Result<ServerHandle, StorageError> {
        let listener = TcpListener::bind(&self.config.listen_addr).map_err(|err| {
            StorageError::Transport {
                endpoint: self.config.listen_addr.clone(),
                source: err,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|err| StorageError::Transport {
            endpoint: self.config.listen_addr.clone(),
            source: err,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|err| StorageError::Transport {
                endpoint: self.config.listen_addr.clone(),
                source: err,
            })?;

        let cancel = CancelToken::new();
        let accept_cancel = cancel.clone();
        let join = thread::Builder::new()
            .name("storage-server".to_string())
            .spawn(move || self.accept_loop(listener, accept_cancel))
            .map_err(|err| StorageError::Io {
                path: None,
                source: err,
            })?;

        tracing::info!(addr = %local_addr, "storage server listening");
        Ok(ServerHandle {
            cancel,
            join,
            local_addr,
        })
    }

    fn accept_loop(self, listener: TcpListener, cancel: CancelToken) {
        let active = Arc::new(AtomicUsize::new(0));
        while !cancel.is_cancelled() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if active.load(Ordering::Relaxed) >= self.config.max_connections {
                        tracing::warn!(%peer, "connection limit reached, dropping");
                        continue;
                    }
                    if let Err(err) = prepare_stream(&stream, &self.config) {
                        tracing::debug!(%peer, error = %err, "session setup failed");
                        continue;
                    }
                    active.fetch_add(1, Ordering::Relaxed);
                    let session = Session {
                        storage: Arc::clone(&self.storage),
                        codec: self.codec.clone(),
                        config: self.config.clone(),
                        cancel: cancel.clone(),
                    };
                    let active_for_thread = Arc::clone(&active);
                    let spawned = thread::Builder::new()
                        .name(format!("storage-session-{peer}"))
                        .spawn(move || {
                            session.run(stream, peer);
                            active_for_thread.fetch_sub(1, Ordering::Relaxed);
                        });
                    if let Err(err) = spawned {
                        active.fetch_sub(1, Ordering::Relaxed);
                        tracing::warn!(%peer, error = %err, "session thread spawn failed");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

fn prepare_stream(stream: &TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.idle_timeout))?;
    stream.set_write_timeout(Some(config.io_timeout))?;
    Ok(())
}

struct Session<K, S, C> {
    storage: Arc<dyn CrdtStorage<K, S>>,
    codec: C,
    config: ServerConfig,
    cancel: CancelToken,
}

impl<K, S, C> Session<K, S, C>
where
    K: Key,
    S: Crdt,
    C: CrdtCodec<K, S>,
{
    fn run(self, mut stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, "session opened");
        loop {
            if self.cancel.is_cancelled() {
                let _ = write_command(
                    &mut stream,
                    &Command::Error {
                        message: "node is shutting down".to_string(),
                    },
                );
                break;
            }
            let command = match read_command(&mut stream) {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(err) => {
                    if matches!(err.kind(), crate::error::ErrorKind::Malformed) {
                        let _ = write_command(
                            &mut stream,
                            &Command::Error {
                                message: format!("malformed command: {err}"),
                            },
                        );
                    }
                    tracing::debug!(%peer, error = %err, "session closed on command error");
                    break;
                }
            };
            // The command may have raced a shutdown; refuse rather than
            // serve half a session.
            if self.cancel.is_cancelled() {
                let _ = write_command(
                    &mut stream,
                    &Command::Error {
                        message: "node is shutting down".to_string(),
                    },
                );
                break;
            }

            let keep_going = match command {
                Command::Upload { compressed } => self.serve_upload(&mut stream, compressed),
                Command::Download { since, compressed } => {
                    self.serve_download(&mut stream, since.map(Stamp::new), compressed)
                }
                Command::Remove { compressed } => self.serve_remove(&mut stream, compressed),
                Command::Ping => write_command(&mut stream, &Command::Ok).is_ok(),
                Command::Ok | Command::Error { .. } => {
                    // An ack with no stream to acknowledge: caller bug.
                    let err = WireError::UnexpectedCommand {
                        got: "ack outside a session",
                    };
                    let _ = write_command(
                        &mut stream,
                        &Command::Error {
                            message: err.to_string(),
                        },
                    );
                    false
                }
            };
            if !keep_going {
                break;
            }
        }
        tracing::debug!(%peer, "session closed");
    }

    /// Returns whether the connection is still usable for another command.
    fn serve_upload(&self, stream: &mut TcpStream, compressed: bool) -> bool {
        let mut sink = match self.storage.upload() {
            Ok(sink) => Some(sink),
            Err(err) => return refuse(stream, &err),
        };

        let mut accepted = 0u64;
        let outcome = {
            let mut reader = FrameReader::new(
                WireReader::new(&mut *stream, method_for(compressed)),
                self.config.max_frame_bytes,
            );
            loop {
                if self.cancel.is_cancelled() {
                    break StreamOutcome::Cancelled;
                }
                match reader.read_frame() {
                    Ok(Some(frame)) => match self.codec.decode_record(&frame) {
                        Ok(record) => {
                            match sink.as_mut().expect("sink live while reading").accept(record)
                            {
                                Ok(()) => accepted += 1,
                                Err(err) => break StreamOutcome::Failed(err.to_string()),
                            }
                        }
                        Err(err) => break StreamOutcome::Failed(err.to_string()),
                    },
                    Ok(None) => break StreamOutcome::Completed,
                    Err(err) => break StreamOutcome::Failed(err.to_string()),
                }
            }
        };

        match outcome {
            StreamOutcome::Completed => {
                match sink.take().expect("sink live until outcome").complete() {
                    Ok(()) => {
                        metrics::counter("server_records_uploaded", accepted, Vec::new());
                        write_command(stream, &Command::Ok).is_ok()
                    }
                    Err(err) => refuse(stream, &err),
                }
            }
            StreamOutcome::Cancelled => {
                sink.take().expect("sink live until outcome").abort();
                let _ = write_command(
                    stream,
                    &Command::Error {
                        message: "node is shutting down".to_string(),
                    },
                );
                false
            }
            StreamOutcome::Failed(message) => {
                sink.take().expect("sink live until outcome").abort();
                let _ = write_command(stream, &Command::Error { message });
                false
            }
        }
    }

    fn serve_download(
        &self,
        stream: &mut TcpStream,
        since: Option<Stamp>,
        compressed: bool,
    ) -> bool {
        let method = method_for(compressed);
        let records = match self.storage.download(since) {
            Ok(records) => records,
            Err(err) => {
                // The peer expects frames now, not a command; closing the
                // connection is the only in-contract failure signal.
                tracing::warn!(error = %err, "download refused");
                return false;
            }
        };

        let mut writer = FrameWriter::new(WireWriter::new(&mut *stream, method));
        for record in records {
            if self.cancel.is_cancelled() {
                return false;
            }
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    // Mid-stream failure: no inline signal exists, so the
                    // peer sees a truncated stream.
                    tracing::warn!(error = %err, "download stream failed mid-flight");
                    return false;
                }
            };
            let payload = match self.codec.encode_record(&record) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "record encode failed during download");
                    return false;
                }
            };
            if writer.write_frame(&payload).is_err() {
                return false;
            }
        }
        if writer.finish().is_err() {
            return false;
        }
        if writer.into_inner().into_inner().is_err() {
            return false;
        }
        if let Err(err) = stream.flush() {
            tracing::debug!(error = %err, "flush after download failed");
            return false;
        }

        // The receiver acks the stream before the connection is reusable.
        match read_command(stream) {
            Ok(Some(Command::Ok)) => true,
            Ok(other) => {
                tracing::debug!(?other, "download was not acknowledged");
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "download ack failed");
                false
            }
        }
    }

    fn serve_remove(&self, stream: &mut TcpStream, compressed: bool) -> bool {
        let mut sink = match self.storage.remove() {
            Ok(sink) => Some(sink),
            Err(err) => return refuse(stream, &err),
        };

        let outcome = {
            let mut reader = FrameReader::new(
                WireReader::new(&mut *stream, method_for(compressed)),
                self.config.max_frame_bytes,
            );
            loop {
                if self.cancel.is_cancelled() {
                    break StreamOutcome::Cancelled;
                }
                match reader.read_frame() {
                    Ok(Some(frame)) => {
                        match decode_tombstone::<K, S, C>(&self.codec, &frame) {
                            Ok(tombstone) => {
                                if let Err(err) = sink
                                    .as_mut()
                                    .expect("sink live while reading")
                                    .accept(tombstone)
                                {
                                    break StreamOutcome::Failed(err.to_string());
                                }
                            }
                            Err(err) => break StreamOutcome::Failed(err.to_string()),
                        }
                    }
                    Ok(None) => break StreamOutcome::Completed,
                    Err(err) => break StreamOutcome::Failed(err.to_string()),
                }
            }
        };

        match outcome {
            StreamOutcome::Completed => {
                match sink.take().expect("sink live until outcome").complete() {
                    Ok(()) => write_command(stream, &Command::Ok).is_ok(),
                    Err(err) => refuse(stream, &err),
                }
            }
            StreamOutcome::Cancelled => {
                sink.take().expect("sink live until outcome").abort();
                false
            }
            StreamOutcome::Failed(message) => {
                sink.take().expect("sink live until outcome").abort();
                let _ = write_command(stream, &Command::Error { message });
                false
            }
        }
    }
}

enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

fn method_for(compressed: bool) -> CompressionMethod {
    if compressed {
        CompressionMethod::Lz4
    } else {
        CompressionMethod::None
    }
}

fn refuse(stream: &mut TcpStream, err: &StorageError) -> bool {
    let _ = write_command(
        stream,
        &Command::Error {
            message: err.to_string(),
        },
    );
    false
}
