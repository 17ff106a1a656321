//! File store backing the protocol commands.
//!
//! The store is a flat namespace of named files. Keys are validated by the
//! protocol layer before they get here, so implementations may join them
//! directly onto their root.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Subdirectory holding in-flight uploads. Stored names cannot contain a
/// path separator, so nothing in here is reachable through the protocol.
const TEMP_DIR: &str = ".tmp";

/// Store operation errors
#[derive(Debug)]
pub enum StoreError {
    /// No entry with this name
    NotFound(String),
    /// Underlying filesystem failure
    Io(io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(name) => write!(f, "{} not found", name),
            StoreError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::NotFound(_) => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the server delegates to.
pub trait FileStore: Send + Sync {
    fn list(&self) -> StoreResult<Vec<String>>;
    fn read(&self, name: &str) -> StoreResult<Vec<u8>>;
    fn write(&self, name: &str, contents: &[u8]) -> StoreResult<()>;
    fn delete(&self, name: &str) -> StoreResult<()>;
}

/// Store rooted at a single directory.
///
/// Writes land in a temp file under `<root>/.tmp/` first and are renamed
/// over the target, so concurrent uploads of one name resolve to whichever
/// rename runs last.
pub struct DirStore {
    root: PathBuf,
    temp_dir: PathBuf,
    temp_counter: AtomicU64,
}

impl DirStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let temp_dir = root.join(TEMP_DIR);
        fs::create_dir_all(&temp_dir).map_err(StoreError::Io)?;
        info!(root = %root.display(), "Opened file store");
        Ok(Self {
            root,
            temp_dir,
            temp_counter: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.temp_dir
            .join(format!("upload-{}-{}", std::process::id(), seq))
    }
}

fn map_not_found(name: &str, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::Io(e)
    }
}

impl FileStore for DirStore {
    fn list(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(StoreError::Io)? {
            let entry = entry.map_err(StoreError::Io)?;
            if !entry.file_type().map_err(StoreError::Io)?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        trace!(count = names.len(), "Listed store");
        Ok(names)
    }

    fn read(&self, name: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_of(name);
        if path.is_dir() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        fs::read(&path).map_err(|e| map_not_found(name, e))
    }

    fn write(&self, name: &str, contents: &[u8]) -> StoreResult<()> {
        let temp = self.temp_path();
        let result = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&temp, self.path_of(name))
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(StoreError::Io(e));
        }

        debug!(name, bytes = contents.len(), "Stored file");
        Ok(())
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        let path = self.path_of(name);
        if path.is_dir() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        fs::remove_file(&path).map_err(|e| map_not_found(name, e))?;
        debug!(name, "Deleted file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store() -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path().join("uploads")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        store.write("a.bin", &[1, 2, 3]).unwrap();
        assert_eq!(store.read("a.bin").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_missing() {
        let (_dir, store) = store();
        match store.read("missing.txt") {
            Err(StoreError::NotFound(name)) => assert_eq!(name, "missing.txt"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        store.write("gone.txt", b"x").unwrap();
        store.delete("gone.txt").unwrap();
        assert!(matches!(store.read("gone.txt"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.delete("gone.txt"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_sorted_files_only() {
        let (_dir, store) = store();
        store.write("b", b"2").unwrap();
        store.write("a", b"1").unwrap();
        store.write("c", b"3").unwrap();
        fs::create_dir(store.root().join("subdir")).unwrap();
        fs::write(store.root().join(TEMP_DIR).join("upload-0-0"), b"").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dot_names_are_listed() {
        let (_dir, store) = store();
        store.write("A", b"a").unwrap();
        store.write(".upload-B", b"b").unwrap();
        store.write(".hidden", b"h").unwrap();

        assert_eq!(store.list().unwrap(), vec![".hidden", ".upload-B", "A"]);
        assert_eq!(store.read(".upload-B").unwrap(), b"b");
    }

    #[test]
    fn test_temp_dir_not_reachable() {
        let (_dir, store) = store();
        store.write("x", b"x").unwrap();
        assert!(matches!(store.read(TEMP_DIR), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(TEMP_DIR), Err(StoreError::NotFound(_))));
        assert_eq!(fs::read_dir(store.root().join(TEMP_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_overwrite() {
        let (_dir, store) = store();
        store.write("f", b"first").unwrap();
        store.write("f", b"second").unwrap();
        assert_eq!(store.read("f").unwrap(), b"second");
    }

    #[test]
    fn test_concurrent_writes_same_name() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64 * 1024]).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.write("shared.bin", &payload).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Last write wins, but never a mix of two writers.
        let contents = store.read("shared.bin").unwrap();
        assert!(payloads.contains(&contents));
        assert_eq!(store.list().unwrap(), vec!["shared.bin"]);
    }
}
