//! Per-connection request handling.
//!
//! One accepted connection carries exactly one request and one response:
//! read until the sentinel, dispatch, write the envelope, close.

use crate::codec::{self, FramingError};
use crate::dispatch::Dispatcher;
use crate::protocol::{Response, Status};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Envelope written when serialization itself fails.
const FALLBACK_ERROR: &[u8] = br#"{"status":"ERROR","data":"internal server error"}"#;

/// How a connection ended.
#[derive(Debug)]
pub enum Outcome {
    /// A response envelope was written.
    Responded {
        status: Status,
        request_bytes: usize,
        response_bytes: usize,
    },
    /// Peer closed without sending anything; nothing was written.
    Aborted,
    /// Framing or transport failure; the connection was dropped.
    Failed(FramingError),
}

/// Serve one connection end to end.
///
/// `timeout` bounds the whole exchange, from the first read to the last
/// write. The stream is shut down and dropped on every path.
pub fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    timeout: Option<Duration>,
) -> Outcome {
    let outcome = serve(&stream, dispatcher, timeout);

    match &outcome {
        Outcome::Responded {
            status,
            request_bytes,
            response_bytes,
        } => info!(
            peer = %peer,
            ?status,
            request_bytes,
            response_bytes,
            "Request served"
        ),
        Outcome::Aborted => debug!(peer = %peer, "Peer closed without a request"),
        Outcome::Failed(e) => warn!(peer = %peer, error = %e, "Connection failed"),
    }

    let _ = stream.shutdown(Shutdown::Both);
    outcome
}

fn serve(stream: &TcpStream, dispatcher: &Dispatcher, timeout: Option<Duration>) -> Outcome {
    let mut stream = DeadlineStream::new(stream, timeout);

    let request = match codec::read_message(&mut stream) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Outcome::Aborted,
        Err(e) => return Outcome::Failed(e),
    };

    let line = String::from_utf8_lossy(&request);
    debug!(bytes = request.len(), "Received request");

    let response = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&line)))
        .unwrap_or_else(|_| {
            error!("Dispatcher panicked");
            Response::error("internal server error")
        });

    let body = response.to_bytes().unwrap_or_else(|e| {
        error!(error = %e, "Failed to encode response");
        FALLBACK_ERROR.to_vec()
    });

    match codec::write_message(&mut stream, &body) {
        Ok(()) => Outcome::Responded {
            status: response.status,
            request_bytes: request.len(),
            response_bytes: body.len(),
        },
        Err(e) => Outcome::Failed(e),
    }
}

/// Socket wrapper enforcing one deadline across every read and write.
///
/// Before each call the socket timeout is reset to the time left, so a
/// peer trickling bytes cannot hold the connection past the deadline.
struct DeadlineStream<'a> {
    stream: &'a TcpStream,
    deadline: Option<Instant>,
}

impl<'a> DeadlineStream<'a> {
    fn new(stream: &'a TcpStream, timeout: Option<Duration>) -> Self {
        Self {
            stream,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Time left before the deadline; `TimedOut` once it has passed.
    fn remaining(&self) -> io::Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connection deadline passed"))
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.remaining()?;
        self.stream.set_read_timeout(left)?;
        self.stream.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let left = self.remaining()?;
        self.stream.set_write_timeout(left)?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
