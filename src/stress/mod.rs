//! Stress harness.
//!
//! Drives many concurrent upload or download sessions against a running
//! server for every combination of file size, client pool size, server pool
//! size and executor, then aggregates one [`RunRecord`] per combination.
//!
//! The server pool size is informational: the operator reconfigures the
//! server between values (optionally pausing with `--wait-for-operator`).

pub mod report;
pub mod stats;
pub mod worker;

use crate::client::Client;
use crate::config::StressSettings;
use crate::protocol::Status;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use stats::{RunKey, RunRecord};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use worker::Session;

const MIB: u64 = 1024 * 1024;

/// Transfer direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Upload => write!(f, "upload"),
            Operation::Download => write!(f, "download"),
        }
    }
}

/// Outcome of one client session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub operation: Operation,
    /// Bytes transferred (0 on failure)
    pub file_size: u64,
    /// Wall-clock seconds
    pub duration: f64,
    /// Bytes per second (0 on failure or zero duration)
    pub throughput: f64,
    pub status: Status,
    pub error: String,
}

impl WorkerResult {
    pub fn failed(
        worker_id: usize,
        operation: Operation,
        duration: f64,
        reason: impl Into<String>,
    ) -> Self {
        WorkerResult {
            worker_id,
            operation,
            file_size: 0,
            duration,
            throughput: 0.0,
            status: Status::Error,
            error: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Harness-level failures; these end the session.
#[derive(Debug)]
pub enum HarnessError {
    Io(PathBuf, io::Error),
    Report(csv::Error),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Io(path, e) => write!(f, "{}: {}", path.display(), e),
            HarnessError::Report(e) => write!(f, "writing results: {}", e),
        }
    }
}

impl std::error::Error for HarnessError {}

/// Generate `<dir>/test_file_<N>MB.bin`, reusing it when the size matches.
pub fn ensure_test_file(dir: &Path, size_mb: u64) -> Result<PathBuf, HarnessError> {
    let path = dir.join(format!("test_file_{}MB.bin", size_mb));
    let expected = size_mb * MIB;

    if let Ok(meta) = fs::metadata(&path) {
        if meta.len() == expected {
            return Ok(path);
        }
    }

    info!(file = %path.display(), size_mb, "Generating test file");
    let io_err = |e| HarnessError::Io(path.clone(), e);
    let mut file = io::BufWriter::new(fs::File::create(&path).map_err(io_err)?);
    let mut chunk = vec![0u8; MIB as usize];
    for _ in 0..size_mb {
        fastrand::fill(&mut chunk);
        file.write_all(&chunk).map_err(io_err)?;
    }
    file.flush().map_err(io_err)?;
    Ok(path)
}

/// Upload the current local copy of a download target.
///
/// Always re-uploads so a regenerated test file never leaves stale content
/// on the server.
pub fn seed(client: &Client, file: &Path) -> bool {
    let name = match file.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };

    let result = fs::read(file)
        .map_err(|e| e.to_string())
        .and_then(|contents| client.upload(name, &contents).map_err(|e| e.to_string()));
    match result {
        Ok(_) => {
            info!(file = name, "Seeded download target");
            true
        }
        Err(e) => {
            warn!(file = name, error = %e, "Failed to seed download target");
            false
        }
    }
}

fn wait_for_operator(server_pool: usize) {
    warn!(
        server_pool,
        "Configure the server with this many workers, then press ENTER"
    );
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}

/// Run the full matrix and return one record per completed run.
pub fn run_session(settings: &StressSettings) -> Result<Vec<RunRecord>, HarnessError> {
    let files_dir = settings.work_dir.join("test_files");
    let download_dir = settings.work_dir.join("downloads");
    for dir in [&files_dir, &download_dir] {
        fs::create_dir_all(dir).map_err(|e| HarnessError::Io(dir.clone(), e))?;
    }

    let client = Client::new(settings.server.clone(), settings.timeout);
    let mut records = Vec::new();

    for &operation in &settings.operations {
        for &server_pool in &settings.server_pools {
            if settings.wait_for_operator {
                wait_for_operator(server_pool);
            } else {
                info!(server_pool, "Assuming server is configured with this pool size");
            }

            for &file_size in &settings.file_sizes {
                let file = ensure_test_file(&files_dir, file_size)?;

                for &client_pool in &settings.client_pools {
                    for &executor in &settings.executors {
                        info!(
                            %operation,
                            file_size_mb = file_size,
                            client_pool,
                            %executor,
                            "Starting run"
                        );

                        if operation == Operation::Download && !seed(&client, &file) {
                            warn!(file_size_mb = file_size, client_pool, "Skipping run");
                            continue;
                        }

                        let session = Session {
                            server: settings.server.clone(),
                            timeout: settings.timeout,
                            operation,
                            file: file.clone(),
                            download_dir: download_dir.clone(),
                            verify: settings.verify,
                        };
                        let results = worker::execute(executor, &session, client_pool);

                        let key = RunKey {
                            operation,
                            file_size_mb: file_size,
                            client_pool_size: client_pool,
                            server_pool_size: server_pool,
                            executor,
                        };
                        let record = RunRecord::from_results(key, &results);
                        report::log_record(&record);
                        records.push(record);
                    }
                }
            }
        }
    }

    Ok(records)
}

/// Run a session and persist its records; returns the CSV path if written.
pub fn run(settings: &StressSettings) -> Result<Option<PathBuf>, HarnessError> {
    let records = run_session(settings)?;

    let path = settings
        .output
        .clone()
        .unwrap_or_else(|| report::default_output(&settings.work_dir));
    let written = report::save_csv(&records, &path).map_err(HarnessError::Report)?;

    if written {
        Ok(Some(path))
    } else {
        warn!("No results to save");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, ServerSettings};
    use crate::server::Server;
    use std::thread;
    use std::time::Duration;

    fn start_server(root: &Path, workers: usize) -> String {
        let server = Server::bind(&ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            workers,
            mode: ExecutionMode::Thread,
            root: root.to_path_buf(),
            timeout: Some(Duration::from_secs(60)),
        })
        .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        thread::spawn(move || server.run());
        addr
    }

    fn settings(server: String, work_dir: &Path) -> StressSettings {
        StressSettings {
            server,
            file_sizes: vec![1],
            client_pools: vec![1, 3],
            server_pools: vec![5],
            executors: vec![ExecutionMode::Thread],
            operations: vec![Operation::Upload, Operation::Download],
            work_dir: work_dir.to_path_buf(),
            output: Some(work_dir.join("results.csv")),
            timeout: Some(Duration::from_secs(60)),
            wait_for_operator: false,
            verify: true,
        }
    }

    #[test]
    fn test_ensure_test_file_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = ensure_test_file(dir.path(), 1).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), MIB);
        let first = fs::read(&path).unwrap();

        let again = ensure_test_file(dir.path(), 1).unwrap();
        assert_eq!(again, path);
        assert_eq!(fs::read(&again).unwrap(), first);
    }

    #[test]
    fn test_ensure_test_file_regenerated_on_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_file_1MB.bin"), b"short").unwrap();
        let path = ensure_test_file(dir.path(), 1).unwrap();
        assert_eq!(fs::metadata(path).unwrap().len(), MIB);
    }

    #[test]
    fn test_session_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(&dir.path().join("server"), 5);
        let settings = settings(addr, dir.path());

        let path = run(&settings).unwrap().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        // header + 2 upload runs + 2 download runs
        assert_eq!(text.lines().count(), 5);

        let records = run_session(&settings).unwrap();
        assert_eq!(records.len(), 4);
        for record in &records {
            assert_eq!(record.fail_count, 0, "{:?}", record);
            assert_eq!(record.success_count, record.client_pool_size);
            assert_eq!(record.server_pool_size, 5);
        }
    }

    #[test]
    fn test_download_seeds_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let server_root = dir.path().join("server");
        let addr = start_server(&server_root, 2);

        let mut settings = settings(addr, dir.path());
        settings.operations = vec![Operation::Download];
        settings.client_pools = vec![2];

        let records = run_session(&settings).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].success_count, 2);
        assert!(server_root.join("test_file_1MB.bin").exists());
    }

    #[test]
    fn test_seed_replaces_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(&dir.path().join("server"), 1);
        let client = Client::new(addr, Some(Duration::from_secs(10)));

        let file = ensure_test_file(dir.path(), 1).unwrap();
        client.upload("test_file_1MB.bin", b"stale").unwrap();

        assert!(seed(&client, &file));
        let (_, contents) = client.get("test_file_1MB.bin").unwrap();
        assert_eq!(contents, fs::read(&file).unwrap());
    }

    #[test]
    fn test_unseedable_download_run_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut settings = settings(format!("127.0.0.1:{}", port), dir.path());
        settings.operations = vec![Operation::Download];
        settings.timeout = Some(Duration::from_secs(2));

        assert!(run_session(&settings).unwrap().is_empty());
        assert_eq!(run(&settings).unwrap(), None);
    }
}
