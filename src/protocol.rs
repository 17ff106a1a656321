//! Text command protocol and JSON response envelope.
//!
//! Requests are a single text line:
//! - `LIST`
//! - `GET <filename>`
//! - `UPLOAD <filename> <base64>`
//! - `DELETE <filename>`
//!
//! The verb is case-insensitive. Responses are a JSON object with a
//! `status` of `OK` or `ERROR` plus an outcome-specific payload.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Maximum filename length accepted as a store key.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Message returned for verbs outside the command table.
pub const UNRECOGNIZED_REQUEST: &str = "unrecognized request";

/// Known request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    List,
    Get,
    Upload,
    Delete,
}

impl Verb {
    /// Look a verb up by its token, ignoring case.
    pub fn from_token(token: &str) -> Option<Self> {
        const TABLE: [(&str, Verb); 4] = [
            ("list", Verb::List),
            ("get", Verb::Get),
            ("upload", Verb::Upload),
            ("delete", Verb::Delete),
        ];
        TABLE
            .iter()
            .find(|(name, _)| token.eq_ignore_ascii_case(name))
            .map(|&(_, verb)| verb)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::List => "LIST",
            Verb::Get => "GET",
            Verb::Upload => "UPLOAD",
            Verb::Delete => "DELETE",
        }
    }
}

/// Parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enumerate stored files
    List,
    /// Fetch one file
    Get { filename: String },
    /// Store a file (payload already base64-decoded)
    Upload { filename: String, data: Vec<u8> },
    /// Remove a file
    Delete { filename: String },
}

/// Request parsing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Nothing but whitespace
    Empty,
    /// Verb not in the command table
    UnknownVerb(String),
    /// Required argument absent
    MissingArgument { verb: Verb, argument: &'static str },
    /// Filename outside the accepted character set
    InvalidFilename(String),
    /// Upload payload is not valid base64
    InvalidPayload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty request"),
            ProtocolError::UnknownVerb(_) => write!(f, "{}", UNRECOGNIZED_REQUEST),
            ProtocolError::MissingArgument { verb, argument } => {
                write!(f, "Invalid {} format: missing {}", verb.as_str(), argument)
            }
            ProtocolError::InvalidFilename(name) => write!(f, "Invalid filename: {:?}", name),
            ProtocolError::InvalidPayload(msg) => write!(f, "Invalid base64 payload: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl Command {
    /// Parse a decoded request line.
    ///
    /// `UPLOAD` splits on the first two separators only so the payload is
    /// captured whole. `GET` and `DELETE` split on the first separator only.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let token = line
            .split_whitespace()
            .next()
            .ok_or(ProtocolError::Empty)?;

        let verb =
            Verb::from_token(token).ok_or_else(|| ProtocolError::UnknownVerb(token.to_string()))?;

        match verb {
            Verb::List => Ok(Command::List),
            Verb::Get => {
                let filename = single_argument(line, verb)?;
                Ok(Command::Get { filename })
            }
            Verb::Delete => {
                let filename = single_argument(line, verb)?;
                Ok(Command::Delete { filename })
            }
            Verb::Upload => Self::parse_upload(line),
        }
    }

    fn parse_upload(line: &str) -> Result<Self, ProtocolError> {
        // Format: UPLOAD <filename> <base64>
        let rest = line
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim_start())
            .unwrap_or("");

        // An empty file encodes to an empty payload, which the trim above removes.
        let (filename, encoded) = match rest.split_once(char::is_whitespace) {
            Some((filename, encoded)) => (filename, encoded.trim()),
            None => (rest, ""),
        };
        if filename.is_empty() {
            return Err(ProtocolError::MissingArgument {
                verb: Verb::Upload,
                argument: "filename",
            });
        }
        validate_filename(filename)?;

        let data = BASE64
            .decode(encoded)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        Ok(Command::Upload {
            filename: filename.to_string(),
            data,
        })
    }

    /// Render the request line sent on the wire (without the sentinel).
    pub fn to_line(&self) -> String {
        match self {
            Command::List => "LIST".to_string(),
            Command::Get { filename } => format!("GET {}", filename),
            Command::Delete { filename } => format!("DELETE {}", filename),
            Command::Upload { filename, data } => {
                let encoded = BASE64.encode(data);
                let mut line = String::with_capacity(8 + filename.len() + encoded.len());
                line.push_str("UPLOAD ");
                line.push_str(filename);
                line.push(' ');
                line.push_str(&encoded);
                line
            }
        }
    }
}

/// Everything after the verb, as one filename.
fn single_argument(line: &str, verb: Verb) -> Result<String, ProtocolError> {
    let filename = line
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim())
        .filter(|s| !s.is_empty())
        .ok_or(ProtocolError::MissingArgument {
            verb,
            argument: "filename",
        })?;
    validate_filename(filename)?;
    Ok(filename.to_string())
}

/// Reject filenames that could escape the flat store namespace.
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_FILENAME_LENGTH
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFilename(name.to_string()))
    }
}

/// Outcome status carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// Generic payload: a message or a file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    Message(String),
    Files(Vec<String>),
}

/// Response envelope.
///
/// Field names are fixed by the wire format; absent payload fields are
/// omitted from the JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_namafile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
}

impl Response {
    /// Successful result carrying a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Response {
            status: Status::Ok,
            data: Some(Data::Message(msg.into())),
            data_namafile: None,
            data_file: None,
        }
    }

    /// Successful listing.
    pub fn files(names: Vec<String>) -> Self {
        Response {
            status: Status::Ok,
            data: Some(Data::Files(names)),
            data_namafile: None,
            data_file: None,
        }
    }

    /// Successful download.
    pub fn file(name: &str, contents: &[u8]) -> Self {
        Response {
            status: Status::Ok,
            data: None,
            data_namafile: Some(name.to_string()),
            data_file: Some(BASE64.encode(contents)),
        }
    }

    /// Failure with a human-readable reason.
    pub fn error(reason: impl Into<String>) -> Self {
        Response {
            status: Status::Error,
            data: Some(Data::Message(reason.into())),
            data_namafile: None,
            data_file: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// The `data` field as a message, if it is one.
    pub fn message_text(&self) -> Option<&str> {
        match &self.data {
            Some(Data::Message(msg)) => Some(msg.as_str()),
            _ => None,
        }
    }

    /// Decode the base64 file body of a download response.
    pub fn file_contents(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.data_file.as_ref().map(|encoded| BASE64.decode(encoded))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
