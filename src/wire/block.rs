//! Compression blocks: groups of frame bytes wrapped in a checksummed header
//! so truncation and corruption are detectable before decompression.
//!
//! Header layout, little-endian:
//! `[magic:8][original_size:u32][compressed_size:u32][method:u8][crc32c:u32]`
//! followed by `compressed_size` payload bytes. The checksum covers the
//! payload as stored.

use std::io::{Read, Write};

use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use super::WireError;

pub const BLOCK_MAGIC: [u8; 8] = *b"LTCBLK01";
pub const BLOCK_HEADER_LEN: usize = 21;

/// Uncompressed bytes buffered before a block is emitted.
pub const DEFAULT_BLOCK_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    #[default]
    None,
    Lz4,
}

impl CompressionMethod {
    fn as_byte(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Lz4 => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Lz4),
            other => Err(WireError::UnknownCompression(other)),
        }
    }
}

pub struct BlockWriter<W: Write> {
    inner: W,
    method: CompressionMethod,
    buf: Vec<u8>,
    block_bytes: usize,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W, method: CompressionMethod) -> Self {
        Self::with_block_bytes(inner, method, DEFAULT_BLOCK_BYTES)
    }

    pub fn with_block_bytes(inner: W, method: CompressionMethod, block_bytes: usize) -> Self {
        Self {
            inner,
            method,
            buf: Vec::new(),
            block_bytes: block_bytes.max(1),
        }
    }

    fn emit_block(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let original = self.buf.len();
        let payload = match self.method {
            CompressionMethod::None => std::mem::take(&mut self.buf),
            CompressionMethod::Lz4 => {
                let compressed = lz4_flex::block::compress(&self.buf);
                self.buf.clear();
                compressed
            }
        };
        let mut header = [0u8; BLOCK_HEADER_LEN];
        header[..8].copy_from_slice(&BLOCK_MAGIC);
        header[8..12].copy_from_slice(&(original as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[16] = self.method.as_byte();
        header[17..21].copy_from_slice(&crc32c(&payload).to_le_bytes());
        self.inner.write_all(&header)?;
        self.inner.write_all(&payload)?;
        Ok(())
    }

    /// Emit any buffered bytes and return the underlying writer, flushed.
    pub fn finish(mut self) -> Result<W, WireError> {
        self.emit_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        if self.buf.len() >= self.block_bytes {
            self.emit_block()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.emit_block()?;
        self.inner.flush()
    }
}

pub struct BlockReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn refill(&mut self) -> std::io::Result<bool> {
        let mut header = [0u8; BLOCK_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(invalid("block header truncated"));
            }
            filled += n;
        }
        if header[..8] != BLOCK_MAGIC {
            return Err(invalid("block magic mismatch"));
        }
        let original = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let compressed =
            u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;
        let method = CompressionMethod::from_byte(header[16])
            .map_err(|err| invalid_owned(err.to_string()))?;
        let expected_crc = u32::from_le_bytes([header[17], header[18], header[19], header[20]]);

        let mut payload = vec![0u8; compressed];
        let mut filled = 0;
        while filled < compressed {
            let n = self.inner.read(&mut payload[filled..])?;
            if n == 0 {
                return Err(invalid("block payload truncated"));
            }
            filled += n;
        }
        let actual_crc = crc32c(&payload);
        if actual_crc != expected_crc {
            return Err(invalid_owned(format!(
                "block checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"
            )));
        }

        self.buf = match method {
            CompressionMethod::None => {
                if payload.len() != original {
                    return Err(invalid("block size mismatch"));
                }
                payload
            }
            CompressionMethod::Lz4 => lz4_flex::block::decompress(&payload, original)
                .map_err(|err| invalid_owned(format!("block decompression failed: {err}")))?,
        };
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        while self.pos == self.buf.len() {
            if !self.refill()? {
                self.done = true;
                return Ok(0);
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn invalid(message: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

fn invalid_owned(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
