//! src/pool.rs
//!
//! Worker subprocess pool.
//!
//! Workers are keyed by `(executable, environment)`; a worker released
//! after a clean session is handed back verbatim to the next task with the
//! same key, which is what makes broadcast caching worthwhile. The pool
//! also owns the per-worker broadcast resident sets: `destroy` is the one
//! place that can guarantee a dead worker's set is reclaimed, so the sets
//! live in a plain map that `destroy` prunes.
//!
//! # Handshake
//! The production launcher binds an ephemeral loopback listener, spawns the
//! worker executable with `WORKER_FACTORY_PORT` pointing at it, and accepts
//! exactly one connection. That keeps the contract at one bidirectional
//! socket per worker and lets tests substitute a thread-backed launcher.

use crate::host::LocalStorage;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Comma-separated scratch directories, always present in a worker's env.
pub const LOCAL_DIRS_ENV: &str = "LOCAL_DIRS";
/// Set to `1` when pooling is enabled so the worker stays resident.
pub const REUSE_WORKER_ENV: &str = "REUSE_WORKER";
/// Loopback port the spawned worker must connect back to.
pub const WORKER_FACTORY_PORT_ENV: &str = "WORKER_FACTORY_PORT";

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// A connected sidecar worker: one bidirectional socket plus, for spawned
/// workers, the child handle used for forced termination.
pub struct Worker {
    id: u64,
    stream: TcpStream,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl Worker {
    /// Adopts an already-connected peer (no child process to kill).
    pub fn attach(stream: TcpStream) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst),
            stream,
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_child(stream: TcpStream, child: Child) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst),
            stream,
            child: Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Independent handle onto the socket for one half of the session.
    pub fn clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Half-closes the output side so the worker observes EOF on its input.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    /// Closes the socket both ways and kills the child if one exists.
    /// Idempotent; unblocks any thread parked in a read or write on the
    /// socket.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.kill() {
                debug!(worker = self.id, "kill failed (already gone): {}", e);
            }
            let _ = child.wait();
        }
    }
}

/// Seam between the pool and whatever brings a worker to life.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, executable: &str, env: &HashMap<String, String>) -> Result<Worker>;
}

/// Spawns the worker executable and waits for it to connect back.
pub struct ProcessLauncher {
    accept_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(accept_timeout: Duration) -> Self {
        Self { accept_timeout }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, executable: &str, env: &HashMap<String, String>) -> Result<Worker> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .context("failed to bind worker handshake listener")?;
        let port = listener
            .local_addr()
            .context("failed to resolve handshake listener address")?
            .port();

        let mut command = Command::new(executable);
        command
            .envs(env)
            .env(WORKER_FACTORY_PORT_ENV, port.to_string())
            .stdin(Stdio::null());
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker executable {:?}", executable))?;
        debug!(pid = child.id(), executable, port, "spawned worker process");

        listener
            .set_nonblocking(true)
            .context("failed to configure handshake listener")?;
        let started = Instant::now();
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() > self.accept_timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        bail!(
                            "worker {:?} did not connect back within {:?}",
                            executable,
                            self.accept_timeout
                        );
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e).context("worker handshake accept failed");
                }
            }
        };
        stream
            .set_nonblocking(false)
            .context("failed to restore blocking mode on worker socket")?;
        stream
            .set_nodelay(true)
            .context("failed to set TCP_NODELAY on worker socket")?;
        Ok(Worker::with_child(stream, child))
    }
}

/// Pool key: executable plus the full environment map.
#[derive(Clone, PartialEq, Eq, Hash)]
struct WorkerKey {
    executable: String,
    env: BTreeMap<String, String>,
}

impl WorkerKey {
    fn new(executable: &str, env: &HashMap<String, String>) -> Self {
        Self {
            executable: executable.to_string(),
            env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

struct PoolState {
    idle: HashMap<WorkerKey, Vec<Arc<Worker>>>,
    broadcasts: HashMap<u64, Arc<Mutex<HashSet<i64>>>>,
}

/// Host-wide cache of idle workers. All mutation is serialized by one lock;
/// launching happens outside it.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    launcher: Arc<dyn WorkerLauncher>,
    storage: Arc<LocalStorage>,
    reuse: bool,
}

impl WorkerPool {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        storage: Arc<LocalStorage>,
        reuse: bool,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                broadcasts: HashMap::new(),
            }),
            launcher,
            storage,
            reuse,
        }
    }

    pub fn reuse_enabled(&self) -> bool {
        self.reuse
    }

    /// Returns an idle worker for the key or launches a new one. The child
    /// environment is the caller's augmented with `LOCAL_DIRS` and, when
    /// pooling is on, `REUSE_WORKER=1`; the pool key stays the caller's
    /// unaugmented pair.
    pub fn acquire(
        &self,
        executable: &str,
        env: &HashMap<String, String>,
    ) -> Result<Arc<Worker>> {
        let key = WorkerKey::new(executable, env);
        let pooled = self
            .state
            .lock()
            .unwrap()
            .idle
            .get_mut(&key)
            .and_then(|workers| workers.pop());
        if let Some(worker) = pooled {
            debug!(worker = worker.id(), executable, "reusing pooled worker");
            return Ok(worker);
        }

        let mut spawn_env = env.clone();
        spawn_env.insert(LOCAL_DIRS_ENV.to_string(), self.storage.joined());
        if self.reuse {
            spawn_env.insert(REUSE_WORKER_ENV.to_string(), "1".to_string());
        }
        let worker = self
            .launcher
            .launch(executable, &spawn_env)
            .with_context(|| format!("failed to launch worker {:?}", executable))?;
        info!(worker = worker.id(), executable, "launched worker");
        Ok(Arc::new(worker))
    }

    /// Returns a worker to the idle list. Callable only after the worker
    /// emitted its terminal end-of-stream frame for the current task.
    pub fn release(&self, executable: &str, env: &HashMap<String, String>, worker: Arc<Worker>) {
        // A clean session can still lose the race against a late
        // cancellation that destroyed the worker; never pool a dead socket.
        if worker.is_closed() {
            debug!(worker = worker.id(), executable, "dropping destroyed worker on release");
            return;
        }
        let key = WorkerKey::new(executable, env);
        debug!(worker = worker.id(), executable, "worker released to pool");
        self.state
            .lock()
            .unwrap()
            .idle
            .entry(key)
            .or_default()
            .push(worker);
    }

    /// Forcibly terminates a worker and forgets everything the pool knows
    /// about it, including its broadcast resident set. Idempotent.
    pub fn destroy(&self, executable: &str, env: &HashMap<String, String>, worker: &Worker) {
        let key = WorkerKey::new(executable, env);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(workers) = state.idle.get_mut(&key) {
                workers.retain(|w| w.id() != worker.id());
            }
            state.broadcasts.remove(&worker.id());
        }
        worker.close();
        debug!(worker = worker.id(), executable, "worker destroyed");
    }

    /// The broadcast identifiers resident on `worker`, created empty on
    /// first use. The association lives only as long as the pool knows the
    /// worker: [`destroy`](WorkerPool::destroy) discards it.
    pub fn broadcasts_for(&self, worker: &Worker) -> Arc<Mutex<HashSet<i64>>> {
        self.state
            .lock()
            .unwrap()
            .broadcasts
            .entry(worker.id())
            .or_default()
            .clone()
    }

    /// Idle workers currently pooled under `(executable, env)`.
    pub fn idle_count(&self, executable: &str, env: &HashMap<String, String>) -> usize {
        let key = WorkerKey::new(executable, env);
        self.state
            .lock()
            .unwrap()
            .idle
            .get(&key)
            .map_or(0, |workers| workers.len())
    }

    /// Closes every idle worker; returns how many were closed.
    pub fn shutdown_idle(&self) -> usize {
        let workers: Vec<Arc<Worker>> = {
            let mut state = self.state.lock().unwrap();
            let workers: Vec<Arc<Worker>> =
                state.idle.drain().flat_map(|(_, v)| v).collect();
            for worker in &workers {
                state.broadcasts.remove(&worker.id());
            }
            workers
        };
        for worker in &workers {
            worker.close();
        }
        if !workers.is_empty() {
            warn!(count = workers.len(), "closed idle workers on shutdown");
        }
        workers.len()
    }
}
