//! Record framing: a uvarint length prefix followed by the payload bytes.
//! A zero-length frame terminates the stream.

use std::io::{Read, Write};

use bytes::Bytes;

use super::WireError;

const MAX_VARINT_BYTES: usize = 10;

pub fn write_uvarint<W: Write>(writer: &mut W, mut value: u64) -> Result<(), WireError> {
    let mut buf = [0u8; MAX_VARINT_BYTES];
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    writer.write_all(&buf[..n])?;
    Ok(())
}

/// Read a uvarint. `Ok(None)` means the source was exhausted before the first
/// byte; truncation inside the varint is an error.
pub fn read_uvarint<R: Read>(reader: &mut R) -> Result<Option<u64>, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        if read_one(reader, &mut byte)? == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(WireError::TruncatedFrame);
        }
        let bits = u64::from(byte[0] & 0x7f);
        value |= bits
            .checked_shl(shift)
            .ok_or(WireError::LengthOverflow)?;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
    Err(WireError::LengthOverflow)
}

fn read_one<R: Read>(reader: &mut R, buf: &mut [u8; 1]) -> Result<usize, WireError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Parse a uvarint out of a slice, advancing `offset`. `Ok(None)` only when
/// `offset` sits exactly at the end of the buffer.
pub fn parse_uvarint(buf: &[u8], offset: &mut usize) -> Result<Option<u64>, WireError> {
    if *offset == buf.len() {
        return Ok(None);
    }
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_BYTES {
        let Some(byte) = buf.get(*offset + i) else {
            return Err(WireError::TruncatedFrame);
        };
        let bits = u64::from(byte & 0x7f);
        value |= bits
            .checked_shl(shift)
            .ok_or(WireError::LengthOverflow)?;
        if byte & 0x80 == 0 {
            *offset += i + 1;
            return Ok(Some(value));
        }
        shift += 7;
    }
    Err(WireError::LengthOverflow)
}

/// Parse one frame out of a slice, advancing `offset`. `Ok(None)` on a clean
/// end of buffer or an explicit zero-length frame.
pub fn parse_frame<'a>(buf: &'a [u8], offset: &mut usize) -> Result<Option<&'a [u8]>, WireError> {
    let Some(len) = parse_uvarint(buf, offset)? else {
        return Ok(None);
    };
    if len == 0 {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| WireError::LengthOverflow)?;
    let end = offset
        .checked_add(len)
        .ok_or(WireError::LengthOverflow)?;
    if end > buf.len() {
        return Err(WireError::TruncatedFrame);
    }
    let payload = &buf[*offset..end];
    *offset = end;
    Ok(Some(payload))
}

pub struct FrameWriter<W: Write> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), WireError> {
        write_uvarint(&mut self.writer, payload.len() as u64)?;
        self.writer.write_all(payload)?;
        Ok(())
    }

    /// Terminate the stream with a zero-length frame and flush.
    pub fn finish(&mut self) -> Result<(), WireError> {
        write_uvarint(&mut self.writer, 0)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub struct FrameReader<R: Read> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame from a wire stream. `Ok(None)` on the zero-length
    /// terminator; running out of bytes before it is [`WireError::TruncatedFrame`].
    pub fn read_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        match self.read_frame_inner()? {
            FrameEvent::Frame(bytes) => Ok(Some(bytes)),
            FrameEvent::EndOfStream => Ok(None),
            FrameEvent::Eof => Err(WireError::TruncatedFrame),
        }
    }

    /// Like [`read_frame`](Self::read_frame), but a clean end of input at a
    /// frame boundary also yields `Ok(None)`. Used for files, which carry no
    /// explicit terminator.
    pub fn read_frame_allow_eof(&mut self) -> Result<Option<Bytes>, WireError> {
        match self.read_frame_inner()? {
            FrameEvent::Frame(bytes) => Ok(Some(bytes)),
            FrameEvent::EndOfStream | FrameEvent::Eof => Ok(None),
        }
    }

    fn read_frame_inner(&mut self) -> Result<FrameEvent, WireError> {
        let Some(len) = read_uvarint(&mut self.reader)? else {
            return Ok(FrameEvent::Eof);
        };
        if len == 0 {
            return Ok(FrameEvent::EndOfStream);
        }
        let len = usize::try_from(len).map_err(|_| WireError::LengthOverflow)?;
        if len > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                max: self.max_frame_bytes,
                got: len,
            });
        }
        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.reader.read(&mut payload[filled..])?;
            if n == 0 {
                return Err(WireError::TruncatedFrame);
            }
            filled += n;
        }
        Ok(FrameEvent::Frame(Bytes::from(payload)))
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

enum FrameEvent {
    Frame(Bytes),
    EndOfStream,
    Eof,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_and_terminator() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"alpha").unwrap();
        writer.write_frame(b"beta").unwrap();
        writer.finish().unwrap();
        let buf = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(reader.read_frame().unwrap().unwrap().as_ref(), b"alpha");
        assert_eq!(reader.read_frame().unwrap().unwrap().as_ref(), b"beta");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn missing_terminator_is_truncation_on_the_wire() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"alpha").unwrap();
        let buf = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(reader.read_frame().unwrap().unwrap().as_ref(), b"alpha");
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            WireError::TruncatedFrame
        ));
    }

    #[test]
    fn eof_at_boundary_is_fine_for_files() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"alpha").unwrap();
        let buf = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(
            reader.read_frame_allow_eof().unwrap().unwrap().as_ref(),
            b"alpha"
        );
        assert!(reader.read_frame_allow_eof().unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"0123456789").unwrap();
        let mut buf = writer.into_inner();
        buf.truncate(6);

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert!(matches!(
            reader.read_frame_allow_eof().unwrap_err(),
            WireError::TruncatedFrame
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&[7u8; 64]).unwrap();
        let buf = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(buf), 16);
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            WireError::FrameTooLarge { max: 16, got: 64 }
        ));
    }

    #[test]
    fn slice_parser_tracks_offsets() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(b"one").unwrap();
        writer.write_frame(b"two").unwrap();
        let buf = writer.into_inner();

        let mut offset = 0;
        assert_eq!(parse_frame(&buf, &mut offset).unwrap(), Some(&b"one"[..]));
        let after_first = offset;
        assert_eq!(parse_frame(&buf, &mut offset).unwrap(), Some(&b"two"[..]));
        assert_eq!(parse_frame(&buf, &mut offset).unwrap(), None);

        // A truncated second frame leaves the offset at the last good frame.
        let mut cut = buf.clone();
        cut.truncate(after_first + 2);
        let mut offset = 0;
        assert_eq!(parse_frame(&cut, &mut offset).unwrap(), Some(&b"one"[..]));
        assert_eq!(offset, after_first);
        assert!(parse_frame(&cut, &mut offset).is_err());
    }

    #[test]
    fn varint_handles_multi_byte_lengths() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 300).unwrap();
        assert_eq!(buf, vec![0xac, 0x02]);
        let mut offset = 0;
        assert_eq!(parse_uvarint(&buf, &mut offset).unwrap(), Some(300));
    }
}
