//! src/host.rs
//!
//! The host-runtime collaborators the bridge consumes: local scratch
//! storage, the memory-manager release hooks, and the `HostRuntime` handle
//! that owns the process-wide worker pool.

use crate::config::BridgeConfig;
use crate::pool::{ProcessLauncher, WorkerLauncher, WorkerPool};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Local working directories managed by the host.
pub struct LocalStorage {
    dirs: Vec<PathBuf>,
}

impl LocalStorage {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn local_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Comma-separated form handed to workers via `LOCAL_DIRS`.
    pub fn joined(&self) -> String {
        self.dirs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Release hooks into the host's shuffle and unroll memory managers.
///
/// Both releases are keyed by the calling thread's identity on the host
/// side, so they must run on the thread that accumulated the reservations.
pub trait MemoryManagers: Send + Sync {
    fn release_shuffle_memory_for_current_thread(&self);
    fn release_unroll_memory_for_current_thread(&self);
}

/// Used when the enclosing framework tracks no per-thread reservations.
pub struct NoopMemoryManagers;

impl MemoryManagers for NoopMemoryManagers {
    fn release_shuffle_memory_for_current_thread(&self) {}
    fn release_unroll_memory_for_current_thread(&self) {}
}

/// Process-wide bridge state: configuration, storage, memory hooks, and the
/// worker pool. Construct once per host instance and call [`shutdown`]
/// when the host stops; idle workers are closed there, not by finalizers.
///
/// [`shutdown`]: HostRuntime::shutdown
pub struct HostRuntime {
    config: BridgeConfig,
    memory: Arc<dyn MemoryManagers>,
    pool: Arc<WorkerPool>,
    shutting_down: AtomicBool,
}

impl HostRuntime {
    pub fn new(
        config: BridgeConfig,
        storage: LocalStorage,
        memory: Arc<dyn MemoryManagers>,
    ) -> Arc<Self> {
        Self::with_launcher(config, storage, memory, Arc::new(ProcessLauncher::default()))
    }

    /// Builds a runtime whose pool launches workers through `launcher`
    /// instead of spawning subprocesses.
    pub fn with_launcher(
        config: BridgeConfig,
        storage: LocalStorage,
        memory: Arc<dyn MemoryManagers>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Arc<Self> {
        let pool = Arc::new(WorkerPool::new(
            launcher,
            Arc::new(storage),
            config.worker_reuse,
        ));
        Arc::new(Self {
            config,
            memory,
            pool,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManagers> {
        &self.memory
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flags the runtime as stopping and closes every idle worker.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let closed = self.pool.shutdown_idle();
        info!(closed, "host runtime shut down");
    }
}
