//! Blocking client for the file protocol.
//!
//! Each call opens a fresh connection, sends one framed request, reads one
//! framed response and closes.

use crate::codec::{self, FramingError};
use crate::protocol::{Command, Data, Response};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// Client-side failures
#[derive(Debug)]
pub enum ClientError {
    /// Could not resolve or connect to the server
    Connect(io::Error),
    /// Request or response framing failed
    Framing(FramingError),
    /// Server closed without answering
    NoResponse,
    /// Response body was not a valid envelope
    Decode(serde_json::Error),
    /// Envelope was well-formed but missing the expected payload
    UnexpectedResponse(&'static str),
    /// Download body was not valid base64
    Payload(base64::DecodeError),
    /// Server answered with `ERROR`
    Server(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "connect failed: {}", e),
            ClientError::Framing(e) => write!(f, "{}", e),
            ClientError::NoResponse => write!(f, "server closed the connection without a response"),
            ClientError::Decode(e) => write!(f, "invalid response: {}", e),
            ClientError::UnexpectedResponse(what) => write!(f, "response missing {}", what),
            ClientError::Payload(e) => write!(f, "invalid file payload: {}", e),
            ClientError::Server(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<FramingError> for ClientError {
    fn from(e: FramingError) -> Self {
        ClientError::Framing(e)
    }
}

/// Connection parameters for one server
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(addr: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Server address, for tests that need a raw socket
    #[cfg(test)]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> Result<TcpStream, ClientError> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(ClientError::Connect)?
            .collect();

        let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved");
        for addr in addrs {
            let attempt = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream
                        .set_read_timeout(self.timeout)
                        .map_err(ClientError::Connect)?;
                    stream
                        .set_write_timeout(self.timeout)
                        .map_err(ClientError::Connect)?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(ClientError::Connect(last_err))
    }

    /// Send a raw request line and return the envelope, whatever its status.
    pub fn send_line(&self, line: &str) -> Result<Response, ClientError> {
        let mut stream = self.connect()?;
        trace!(addr = %self.addr, bytes = line.len(), "Sending request");

        codec::write_message(&mut stream, line.as_bytes())?;
        let body = codec::read_message(&mut stream)?.ok_or(ClientError::NoResponse)?;

        debug!(addr = %self.addr, bytes = body.len(), "Received response");
        Response::from_bytes(&body).map_err(ClientError::Decode)
    }

    /// Send a command and return the envelope, whatever its status.
    pub fn send(&self, command: &Command) -> Result<Response, ClientError> {
        self.send_line(&command.to_line())
    }

    /// Send a command, turning `ERROR` envelopes into `ClientError::Server`.
    fn request(&self, command: &Command) -> Result<Response, ClientError> {
        let response = self.send(command)?;
        if response.is_ok() {
            Ok(response)
        } else {
            let reason = response
                .message_text()
                .unwrap_or("unknown server error")
                .to_string();
            Err(ClientError::Server(reason))
        }
    }

    pub fn list(&self) -> Result<Vec<String>, ClientError> {
        match self.request(&Command::List)?.data {
            Some(Data::Files(names)) => Ok(names),
            _ => Err(ClientError::UnexpectedResponse("file listing")),
        }
    }

    /// Download a file, returning the server-reported name and its contents.
    pub fn get(&self, filename: &str) -> Result<(String, Vec<u8>), ClientError> {
        let response = self.request(&Command::Get {
            filename: filename.to_string(),
        })?;

        let contents = response
            .file_contents()
            .ok_or(ClientError::UnexpectedResponse("data_file"))?
            .map_err(ClientError::Payload)?;
        let name = response
            .data_namafile
            .unwrap_or_else(|| filename.to_string());
        Ok((name, contents))
    }

    pub fn upload(&self, filename: &str, contents: &[u8]) -> Result<String, ClientError> {
        let response = self.request(&Command::Upload {
            filename: filename.to_string(),
            data: contents.to_vec(),
        })?;
        Ok(response.message_text().unwrap_or_default().to_string())
    }

    pub fn delete(&self, filename: &str) -> Result<String, ClientError> {
        let response = self.request(&Command::Delete {
            filename: filename.to_string(),
        })?;
        Ok(response.message_text().unwrap_or_default().to_string())
    }
}
