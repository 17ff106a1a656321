//! Message framing shared by client and server.
//!
//! Every request and every response is a body followed by the sentinel
//! `\r\n\r\n`. Bodies are text; binary file contents travel base64-encoded
//! so they can never contain the sentinel.
//!
//! Only one message per connection direction is supported. Bytes that
//! arrive after the first sentinel are discarded.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use tracing::trace;

/// End-of-message marker.
pub const SENTINEL: &[u8] = b"\r\n\r\n";

/// Largest single read pulled from the socket.
pub const READ_CHUNK: usize = 1024 * 1024;

/// Slice size used when writing large bodies.
pub const WRITE_CHUNK: usize = 64 * 1024;

/// Framing failures. All of them are fatal for the current connection.
#[derive(Debug)]
pub enum FramingError {
    /// Peer closed the connection after sending part of a message.
    Closed { received: usize },
    /// Read or write deadline expired.
    TimedOut,
    /// Any other socket error.
    Io(io::Error),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Closed { received } => write!(
                f,
                "connection closed before end of message ({} bytes received)",
                received
            ),
            FramingError::TimedOut => write!(f, "connection deadline expired"),
            FramingError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FramingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // Blocking sockets report an expired SO_RCVTIMEO as WouldBlock on Unix
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FramingError::TimedOut,
            _ => FramingError::Io(e),
        }
    }
}

/// Append the sentinel to a serialized body.
pub fn encode(body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() + SENTINEL.len());
    out.extend_from_slice(body);
    out.extend_from_slice(SENTINEL);
    out
}

/// Write one framed message.
pub fn write_message<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), FramingError> {
    if body.len() <= WRITE_CHUNK {
        writer.write_all(&encode(body))?;
    } else {
        for chunk in body.chunks(WRITE_CHUNK) {
            writer.write_all(chunk)?;
        }
        writer.write_all(SENTINEL)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read until the sentinel is seen and return the bytes before it.
///
/// Returns `Ok(None)` when the peer closes without sending anything.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Bytes>, FramingError> {
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(FramingError::Closed {
                received: buffer.len(),
            });
        }

        // The sentinel may straddle two reads.
        let scan_from = buffer.len().saturating_sub(SENTINEL.len() - 1);
        buffer.extend_from_slice(&chunk[..n]);
        trace!(read = n, buffered = buffer.len(), "Read chunk");

        if let Some(pos) = find_sentinel(&buffer[scan_from..]) {
            let end = scan_from + pos;
            buffer.truncate(end);
            return Ok(Some(buffer.freeze()));
        }
    }
}

/// Position of the first sentinel in `buffer`.
pub fn find_sentinel(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(SENTINEL.len())
        .position(|window| window == SENTINEL)
}
