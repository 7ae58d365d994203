//! Wire formats: length-prefixed record frames, optional compression blocks,
//! and null-terminated command envelopes. The same framing is used on the
//! network and inside WAL segments and storage chunks.

use std::io::{Read, Write};

use thiserror::Error;

use crate::error::ErrorKind;

pub mod block;
pub mod command;
pub mod frame;

pub use block::{BlockReader, BlockWriter, CompressionMethod};
pub use command::Command;
pub use frame::{FrameReader, FrameWriter};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream truncated mid-frame")]
    TruncatedFrame,
    #[error("frame length {got} exceeds limit {max}")]
    FrameTooLarge { max: usize, got: usize },
    #[error("length prefix does not fit in u64")]
    LengthOverflow,
    #[error("block magic mismatch")]
    BlockMagicMismatch,
    #[error("block truncated")]
    TruncatedBlock,
    #[error("block checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    BlockChecksumMismatch { expected: u32, got: u32 },
    #[error("unknown compression method {0}")]
    UnknownCompression(u8),
    #[error("block decompression failed: {0}")]
    Decompress(String),
    #[error("command envelope exceeds {max} bytes")]
    CommandTooLarge { max: usize },
    #[error("stream closed before command terminator")]
    TruncatedCommand,
    #[error("command is not valid json: {0}")]
    CommandJson(#[from] serde_json::Error),
    #[error("unexpected command: {got}")]
    UnexpectedCommand { got: &'static str },
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::Io(err) => match err.kind() {
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                    ErrorKind::Malformed
                }
                _ => ErrorKind::Transient,
            },
            WireError::UnexpectedCommand { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Malformed,
        }
    }
}

/// A byte sink that is either raw or chunked into compression blocks.
pub enum WireWriter<W: Write> {
    Plain(W),
    Block(BlockWriter<W>),
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W, method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => WireWriter::Plain(inner),
            method => WireWriter::Block(BlockWriter::new(inner, method)),
        }
    }

    /// Flush any pending block and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W, WireError> {
        match self {
            WireWriter::Plain(inner) => Ok(inner),
            WireWriter::Block(block) => block.finish(),
        }
    }
}

impl<W: Write> Write for WireWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WireWriter::Plain(inner) => inner.write(buf),
            WireWriter::Block(block) => block.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WireWriter::Plain(inner) => inner.flush(),
            WireWriter::Block(block) => block.flush(),
        }
    }
}

/// A byte source that is either raw or assembled from compression blocks.
pub enum WireReader<R: Read> {
    Plain(R),
    Block(BlockReader<R>),
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R, method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => WireReader::Plain(inner),
            CompressionMethod::Lz4 => WireReader::Block(BlockReader::new(inner)),
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            WireReader::Plain(inner) => inner,
            WireReader::Block(block) => block.into_inner(),
        }
    }
}

impl<R: Read> Read for WireReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            WireReader::Plain(inner) => inner.read(buf),
            WireReader::Block(block) => block.read(buf),
        }
    }
}
