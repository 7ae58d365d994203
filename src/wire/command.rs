//! Command envelopes: small JSON messages terminated by a NUL byte.
//!
//! Commands open sessions (`upload`, `download`, `remove`, `ping`) and close
//! record streams (`ok`, `error`). The NUL terminator is fixed; the JSON body
//! is the pluggable part.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use super::WireError;

/// Upper bound on an encoded command. Commands are small; anything bigger is
/// a framing bug on the peer.
pub const MAX_COMMAND_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A record stream follows, terminated by a zero-length frame.
    Upload { compressed: bool },
    /// Request a record stream of everything visible at or after `since`.
    Download {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
        compressed: bool,
    },
    /// A tombstone stream follows, terminated by a zero-length frame.
    Remove { compressed: bool },
    /// Liveness probe; answered with `ok`.
    Ping,
    /// Positive end-of-stream acknowledgement.
    Ok,
    /// Negative acknowledgement; the session is over.
    Error { message: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Upload { .. } => "upload",
            Command::Download { .. } => "download",
            Command::Remove { .. } => "remove",
            Command::Ping => "ping",
            Command::Ok => "ok",
            Command::Error { .. } => "error",
        }
    }
}

pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<(), WireError> {
    let body = serde_json::to_vec(command)?;
    writer.write_all(&body)?;
    writer.write_all(&[0])?;
    writer.flush()?;
    Ok(())
}

/// Read one command. `Ok(None)` when the peer closed the stream before any
/// byte arrived; truncation inside an envelope is an error.
pub fn read_command<R: Read>(reader: &mut R) -> Result<Option<Command>, WireError> {
    let mut body = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = loop {
            match reader.read(&mut byte) {
                Ok(n) => break n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };
        if n == 0 {
            if body.is_empty() {
                return Ok(None);
            }
            return Err(WireError::TruncatedCommand);
        }
        if byte[0] == 0 {
            break;
        }
        body.push(byte[0]);
        if body.len() > MAX_COMMAND_BYTES {
            return Err(WireError::CommandTooLarge {
                max: MAX_COMMAND_BYTES,
            });
        }
    }
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Read the acknowledgement that closes a record stream.
pub fn read_ack<R: Read>(reader: &mut R) -> Result<Result<(), String>, WireError> {
    match read_command(reader)? {
        Some(Command::Ok) => Ok(Ok(())),
        Some(Command::Error { message }) => Ok(Err(message)),
        Some(other) => Err(WireError::UnexpectedCommand { got: other.name() }),
        None => Err(WireError::TruncatedCommand),
    }
}
