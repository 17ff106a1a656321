//! Client sessions and the executors that run them concurrently.

use super::{Operation, WorkerResult};
use crate::client::Client;
use crate::config::{ExecutionMode, WorkerArgs};
use crate::protocol::Status;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything one session needs, independent of where it runs.
#[derive(Debug, Clone)]
pub struct Session {
    pub server: String,
    pub timeout: Option<Duration>,
    pub operation: Operation,
    pub file: PathBuf,
    pub download_dir: PathBuf,
    pub verify: bool,
}

impl Session {
    fn client(&self) -> Client {
        Client::new(self.server.clone(), self.timeout)
    }

    fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Run the session in the current thread.
    ///
    /// `expected` is the source content used for download verification.
    pub fn run(&self, worker_id: usize, expected: Option<&[u8]>) -> WorkerResult {
        match self.operation {
            Operation::Upload => self.upload(worker_id),
            Operation::Download => self.download(worker_id, expected),
        }
    }

    fn upload(&self, worker_id: usize) -> WorkerResult {
        let start = Instant::now();
        let name = self.file_name();

        let outcome = fs::read(&self.file)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                info!(
                    worker = worker_id,
                    file = %name,
                    mib = %format!("{:.2}", contents.len() as f64 / 1024.0 / 1024.0),
                    "Uploading"
                );
                self.client()
                    .upload(&name, &contents)
                    .map(|_| contents.len() as u64)
                    .map_err(|e| e.to_string())
            });

        finish(worker_id, Operation::Upload, start.elapsed(), outcome)
    }

    fn download(&self, worker_id: usize, expected: Option<&[u8]>) -> WorkerResult {
        let start = Instant::now();
        let name = self.file_name();
        info!(worker = worker_id, file = %name, "Downloading");

        let fetched = self.client().get(&name);
        let elapsed = start.elapsed();

        let outcome = fetched
            .map_err(|e| e.to_string())
            .and_then(|(_, contents)| {
                if self.verify {
                    if let Some(expected) = expected {
                        if expected != contents.as_slice() {
                            return Err(format!(
                                "downloaded content differs from source ({} vs {} bytes)",
                                contents.len(),
                                expected.len()
                            ));
                        }
                    }
                }
                let target = self.download_dir.join(format!("{}_{}", worker_id, name));
                fs::write(&target, &contents)
                    .map_err(|e| format!("writing {}: {}", target.display(), e))?;
                Ok(contents.len() as u64)
            });

        finish(worker_id, Operation::Download, elapsed, outcome)
    }
}

fn finish(
    worker_id: usize,
    operation: Operation,
    elapsed: Duration,
    outcome: Result<u64, String>,
) -> WorkerResult {
    let duration = elapsed.as_secs_f64();
    match outcome {
        Ok(bytes) => {
            let throughput = if duration > 0.0 {
                bytes as f64 / duration
            } else {
                0.0
            };
            info!(
                worker = worker_id,
                %operation,
                duration_s = %format!("{:.2}", duration),
                mib_s = %format!("{:.2}", throughput / 1024.0 / 1024.0),
                "Completed"
            );
            WorkerResult {
                worker_id,
                operation,
                file_size: bytes,
                duration,
                throughput,
                status: Status::Ok,
                error: String::new(),
            }
        }
        Err(reason) => {
            error!(worker = worker_id, %operation, error = %reason, "Failed");
            WorkerResult::failed(worker_id, operation, duration, reason)
        }
    }
}

/// Run `count` copies of `session` concurrently and wait for all of them.
pub fn execute(executor: ExecutionMode, session: &Session, count: usize) -> Vec<WorkerResult> {
    match executor {
        ExecutionMode::Thread => execute_threads(session, count),
        ExecutionMode::Process => execute_processes(session, count),
    }
}

fn load_expected(session: &Session) -> Option<Vec<u8>> {
    if !(session.verify && session.operation == Operation::Download) {
        return None;
    }
    match fs::read(&session.file) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(file = %session.file.display(), error = %e, "Cannot load source for verification");
            None
        }
    }
}

fn execute_threads(session: &Session, count: usize) -> Vec<WorkerResult> {
    let expected = load_expected(session);
    let expected = expected.as_deref();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..count)
            .map(|worker_id| {
                thread::Builder::new()
                    .name(format!("client-{worker_id}"))
                    .spawn_scoped(scope, move || session.run(worker_id, expected))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker_id, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    WorkerResult::failed(worker_id, session.operation, 0.0, "worker panicked")
                }),
                Err(e) => WorkerResult::failed(
                    worker_id,
                    session.operation,
                    0.0,
                    format!("spawn failed: {}", e),
                ),
            })
            .collect()
    })
}

fn execute_processes(session: &Session, count: usize) -> Vec<WorkerResult> {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            let reason = format!("cannot locate executable: {}", e);
            return (0..count)
                .map(|id| WorkerResult::failed(id, session.operation, 0.0, reason.clone()))
                .collect();
        }
    };

    // Start every child before waiting on any so they run concurrently.
    let children: Vec<_> = (0..count)
        .map(|worker_id| worker_command(&exe, session, worker_id).spawn())
        .collect();

    children
        .into_iter()
        .enumerate()
        .map(|(worker_id, child)| match child.and_then(|c| c.wait_with_output()) {
            Ok(output) => child_result(worker_id, session.operation, &output),
            Err(e) => WorkerResult::failed(
                worker_id,
                session.operation,
                0.0,
                format!("worker process: {}", e),
            ),
        })
        .collect()
}

/// Result a finished `stress-worker` child reported on its last stdout line.
fn child_result(worker_id: usize, operation: Operation, output: &Output) -> WorkerResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str::<WorkerResult>(line).ok());

    match parsed {
        Some(result) if output.status.success() => result,
        _ => WorkerResult::failed(
            worker_id,
            operation,
            0.0,
            format!("worker process exited with {}", output.status),
        ),
    }
}

fn worker_command(exe: &Path, session: &Session, worker_id: usize) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("stress-worker")
        .arg("--server")
        .arg(&session.server)
        .arg("--operation")
        .arg(session.operation.to_string())
        .arg("--file")
        .arg(&session.file)
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .arg("--timeout")
        .arg(session.timeout.map_or(0, |t| t.as_secs()).to_string())
        .arg("--download-dir")
        .arg(&session.download_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if session.verify {
        cmd.arg("--verify");
    }
    cmd
}

/// Entry point of the hidden `stress-worker` subcommand.
///
/// Prints the result as a single JSON line on stdout.
pub fn run_child(args: WorkerArgs) -> io::Result<()> {
    let session = Session {
        server: args.server,
        timeout: crate::config::timeout_from_secs(args.timeout),
        operation: args.operation,
        file: args.file,
        download_dir: args.download_dir,
        verify: args.verify,
    };
    let expected = load_expected(&session);
    let result = session.run(args.worker_id, expected.as_deref());

    let line = serde_json::to_string(&result)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()
}
