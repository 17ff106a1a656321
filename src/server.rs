//! TCP server for the file protocol.
//!
//! Binds one listening socket and serves it with one of two execution
//! models, fixed for the process lifetime:
//! - thread: a single accept loop feeding a fixed pool of worker threads
//! - process: N forked workers, each accepting on the inherited socket and
//!   handling its connections serially

use crate::config::{ExecutionMode, ServerSettings};
use crate::connection::handle_connection;
use crate::dispatch::Dispatcher;
use crate::storage::DirStore;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Listen backlog; large enough that bursts of clients are queued, not refused.
pub const BACKLOG: i32 = 128;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Server instance
pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    workers: usize,
    mode: ExecutionMode,
    timeout: Option<Duration>,
}

impl Server {
    /// Open the store and bind the listening socket.
    ///
    /// Bind and listen failures are returned here and abort startup.
    pub fn bind(settings: &ServerSettings) -> io::Result<Self> {
        let store = DirStore::open(&settings.root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let dispatcher = Dispatcher::new(Arc::new(store));
        let addr = resolve(&settings.listen)?;
        let listener = create_listener(addr)?;

        Ok(Server {
            listener,
            dispatcher,
            workers: settings.workers.max(1),
            mode: settings.mode,
            timeout: settings.timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the process is terminated.
    pub fn run(self) -> io::Result<()> {
        info!(
            address = %self.local_addr()?,
            mode = %self.mode,
            workers = self.workers,
            pid = std::process::id(),
            "Server listening"
        );

        match self.mode {
            ExecutionMode::Thread => self.run_threads(),
            ExecutionMode::Process => self.run_processes(),
        }
    }

    fn run_threads(self) -> io::Result<()> {
        let pool = WorkerPool::new(self.workers, self.dispatcher, self.timeout)?;

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    if let Err(e) = pool.submit(stream, peer) {
                        error!(error = %e, "Worker pool unavailable");
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }
    }

    #[cfg(unix)]
    fn run_processes(self) -> io::Result<()> {
        let mut children: Vec<libc::pid_t> = Vec::with_capacity(self.workers);

        for worker_id in 0..self.workers {
            // SAFETY: the child only runs the serial accept loop on state it
            // owns after the fork and never returns into the parent's stack.
            match unsafe { libc::fork() } {
                -1 => {
                    let err = io::Error::last_os_error();
                    error!(worker = worker_id, error = %err, "Failed to fork worker");
                    terminate(&children);
                    return Err(err);
                }
                0 => serve_serially(worker_id, &self.listener, &self.dispatcher, self.timeout),
                pid => {
                    info!(worker = worker_id, pid, "Started worker process");
                    children.push(pid);
                }
            }
        }

        for pid in children {
            let mut status: libc::c_int = 0;
            // SAFETY: pid is a child of this process and status is a valid out pointer.
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc == -1 {
                warn!(pid, error = %io::Error::last_os_error(), "waitpid failed");
            } else {
                warn!(pid, status, "Worker process exited");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn run_processes(self) -> io::Result<()> {
        warn!("Process mode needs fork(); falling back to thread mode");
        self.run_threads()
    }
}

/// Accept and handle connections one at a time, forever.
///
/// Each accepted connection is handled exactly once, on this call path.
pub fn serve_serially(
    worker_id: usize,
    listener: &TcpListener,
    dispatcher: &Dispatcher,
    timeout: Option<Duration>,
) -> ! {
    info!(worker = worker_id, pid = std::process::id(), "Worker accepting");
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(worker = worker_id, peer = %peer, "Accepted connection");
                handle_connection(stream, peer, dispatcher, timeout);
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Failed to accept connection");
                thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
}

#[cfg(unix)]
fn terminate(children: &[libc::pid_t]) {
    for &pid in children {
        // SAFETY: signalling and reaping our own children.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
    }
}

type Job = (TcpStream, SocketAddr);

/// Fixed-size pool of connection worker threads.
///
/// Connections queue in the channel while every worker is busy.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, dispatcher: Dispatcher, timeout: Option<Duration>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver = Arc::clone(&receiver);
            let dispatcher = dispatcher.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, dispatcher, timeout))?;
            handles.push(handle);
        }

        info!(workers = size, "Worker pool started");
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Queue a connection for the next idle worker.
    pub fn submit(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker pool shut down"))?;
        sender
            .send((stream, peer))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "all workers exited"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets idle workers fall out of their loop.
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<Job>>>,
    dispatcher: Dispatcher,
    timeout: Option<Duration>,
) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };

        match job {
            Ok((stream, peer)) => {
                handle_connection(stream, peer, &dispatcher, timeout);
            }
            Err(_) => break,
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("could not resolve listen address {}", listen),
        )
    })
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientError};
    use crate::protocol::{Status, UNRECOGNIZED_REQUEST};
    use std::io::Write;
    use std::net::Shutdown;

    fn settings(root: &std::path::Path, workers: usize) -> ServerSettings {
        ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            workers,
            mode: ExecutionMode::Thread,
            root: root.to_path_buf(),
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Start a thread-mode server in the background and return a client for it.
    fn start(workers: usize) -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&settings(dir.path(), workers)).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        (dir, Client::new(addr.to_string(), Some(Duration::from_secs(10))))
    }

    #[test]
    fn test_upload_get_roundtrip() {
        let (_dir, client) = start(2);
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        client.upload("data.bin", &payload).unwrap();
        let (name, contents) = client.get("data.bin").unwrap();
        assert_eq!(name, "data.bin");
        assert_eq!(contents, payload);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, client) = start(1);
        match client.get("never.bin") {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "never.bin not found"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, client) = start(2);
        for name in ["A", "B", "C"] {
            client.upload(name, name.as_bytes()).unwrap();
        }
        client.delete("B").unwrap();

        let mut names = client.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["A", "C"]);
        assert!(matches!(client.get("B"), Err(ClientError::Server(_))));
    }

    #[test]
    fn test_unknown_verb_keeps_serving() {
        let (_dir, client) = start(1);
        let resp = client.send_line("SHUTDOWN now").unwrap();
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message_text(), Some(UNRECOGNIZED_REQUEST));
        assert!(client.list().is_ok());
    }

    #[test]
    fn test_partial_request_does_not_kill_worker() {
        let (_dir, client) = start(1);
        let addr = client.addr().to_string();

        let mut stream = TcpStream::connect(&addr).unwrap();
        stream.write_all(b"UPLOAD half.bin QUJD").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        drop(stream);

        // The only worker must still be alive to answer this.
        assert!(client.list().unwrap().is_empty());
    }

    #[test]
    fn test_parallel_uploads_no_crosstalk() {
        let workers = 3;
        let (_dir, client) = start(workers);
        let clients = workers * 3;

        let handles: Vec<_> = (0..clients)
            .map(|i| {
                let client = client.clone();
                thread::spawn(move || {
                    let payload = vec![i as u8; 50_000 + i * 1000];
                    client.upload(&format!("file-{i}.bin"), &payload).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..clients {
            let (_, contents) = client.get(&format!("file-{i}.bin")).unwrap();
            assert_eq!(contents, vec![i as u8; 50_000 + i * 1000]);
        }
    }

    #[test]
    fn test_serial_worker_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(store));
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || serve_serially(0, &listener, &dispatcher, None));

        let client = Client::new(addr.to_string(), Some(Duration::from_secs(10)));
        client.upload("serial.txt", b"one at a time").unwrap();
        assert_eq!(client.get("serial.txt").unwrap().1, b"one at a time");
    }

    #[test]
    fn test_serial_workers_share_listener() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(store));
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let workers = 3;
        for worker_id in 0..workers {
            let listener = listener.try_clone().unwrap();
            let dispatcher = dispatcher.clone();
            thread::spawn(move || serve_serially(worker_id, &listener, &dispatcher, None));
        }

        let client = Client::new(addr.to_string(), Some(Duration::from_secs(10)));
        let clients = workers * 4;
        let handles: Vec<_> = (0..clients)
            .map(|i| {
                let client = client.clone();
                thread::spawn(move || {
                    let payload = vec![(i * 7) as u8; 40_000 + i * 513];
                    client.upload(&format!("shared-{i}.bin"), &payload).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(client.list().unwrap().len(), clients);
        for i in 0..clients {
            let (_, contents) = client.get(&format!("shared-{i}.bin")).unwrap();
            assert_eq!(contents, vec![(i * 7) as u8; 40_000 + i * 513]);
        }
    }

    #[test]
    fn test_dot_prefixed_upload_is_listed() {
        let (_dir, client) = start(2);
        client.upload("A", b"a").unwrap();
        client.upload(".upload-B", b"b").unwrap();

        assert_eq!(client.get(".upload-B").unwrap().1, b"b");
        assert_eq!(client.list().unwrap(), vec![".upload-B", "A"]);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let dir = tempfile::tempdir().unwrap();
        let first = Server::bind(&settings(dir.path(), 1)).unwrap();
        let mut taken = settings(dir.path(), 1);
        taken.listen = first.local_addr().unwrap().to_string();
        assert!(Server::bind(&taken).is_err());
    }
}
