//! Command dispatch.
//!
//! Turns a decoded request line into exactly one response envelope.
//! Parse failures and store failures both become `ERROR` envelopes; nothing
//! escapes to the connection layer.

use crate::protocol::{Command, ProtocolError, Response};
use crate::storage::{FileStore, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes commands to the file store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn FileStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }

    /// Parse and execute one request line.
    pub fn dispatch(&self, line: &str) -> Response {
        match Command::parse(line) {
            Ok(command) => self.execute(command),
            Err(e) => {
                match &e {
                    ProtocolError::UnknownVerb(verb) => debug!(verb = %verb, "Unknown verb"),
                    other => debug!(error = %other, "Malformed request"),
                }
                Response::error(e.to_string())
            }
        }
    }

    /// Execute an already-parsed command.
    pub fn execute(&self, command: Command) -> Response {
        match command {
            Command::List => self.list(),
            Command::Get { filename } => self.get(&filename),
            Command::Upload { filename, data } => self.upload(&filename, &data),
            Command::Delete { filename } => self.delete(&filename),
        }
    }

    fn list(&self) -> Response {
        match self.store.list() {
            Ok(names) => Response::files(names),
            Err(e) => store_failure("List", e),
        }
    }

    fn get(&self, filename: &str) -> Response {
        match self.store.read(filename) {
            Ok(contents) => Response::file(filename, &contents),
            Err(e) => store_failure("Download", e),
        }
    }

    fn upload(&self, filename: &str, data: &[u8]) -> Response {
        match self.store.write(filename, data) {
            Ok(()) => Response::message(format!("File {} uploaded successfully", filename)),
            Err(e) => store_failure("Upload", e),
        }
    }

    fn delete(&self, filename: &str) -> Response {
        match self.store.delete(filename) {
            Ok(()) => Response::message(format!("File {} deleted", filename)),
            Err(e) => store_failure("Delete", e),
        }
    }
}

fn store_failure(operation: &str, e: StoreError) -> Response {
    match e {
        // Clients match on the bare "<name> not found" text
        StoreError::NotFound(_) => Response::error(e.to_string()),
        StoreError::Io(ref io) => {
            warn!(operation, error = %io, "Store operation failed");
            Response::error(format!("{} failed: {}", operation, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Data, Status, UNRECOGNIZED_REQUEST};
    use crate::storage::DirStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        (dir, Dispatcher::new(Arc::new(store)))
    }

    fn upload_line(name: &str, data: &[u8]) -> String {
        format!("UPLOAD {} {}", name, BASE64.encode(data))
    }

    #[test]
    fn test_upload_then_get() {
        let (_dir, d) = dispatcher();
        let payload: Vec<u8> = (0..=255u8).collect();

        let resp = d.dispatch(&upload_line("bytes.bin", &payload));
        assert!(resp.is_ok());
        assert_eq!(
            resp.message_text(),
            Some("File bytes.bin uploaded successfully")
        );

        let resp = d.dispatch("GET bytes.bin");
        assert!(resp.is_ok());
        assert_eq!(resp.data_namafile.as_deref(), Some("bytes.bin"));
        assert_eq!(resp.file_contents().unwrap().unwrap(), payload);
    }

    #[test]
    fn test_delete_then_get_not_found() {
        let (_dir, d) = dispatcher();
        d.dispatch(&upload_line("tmp.txt", b"temp"));

        assert!(d.dispatch("DELETE tmp.txt").is_ok());

        let resp = d.dispatch("GET tmp.txt");
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message_text(), Some("tmp.txt not found"));
    }

    #[test]
    fn test_list_after_delete() {
        let (_dir, d) = dispatcher();
        for name in ["A", "B", "C"] {
            assert!(d.dispatch(&upload_line(name, name.as_bytes())).is_ok());
        }
        assert!(d.dispatch("delete B").is_ok());

        let resp = d.dispatch("LIST");
        match resp.data {
            Some(Data::Files(mut names)) => {
                names.sort();
                assert_eq!(names, vec!["A", "C"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_verb() {
        let (_dir, d) = dispatcher();
        let resp = d.dispatch("FROBNICATE x");
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message_text(), Some(UNRECOGNIZED_REQUEST));
    }

    #[test]
    fn test_malformed_never_reaches_store() {
        let (dir, d) = dispatcher();
        assert_eq!(d.dispatch("GET").status, Status::Error);
        assert_eq!(d.dispatch("UPLOAD ../escape.txt QUJD").status, Status::Error);
        assert_eq!(d.dispatch("").status, Status::Error);
        assert!(!dir.path().join("../escape.txt").exists());
    }

    #[test]
    fn test_delete_missing() {
        let (_dir, d) = dispatcher();
        let resp = d.dispatch("DELETE nothing.txt");
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message_text(), Some("nothing.txt not found"));
    }
}
