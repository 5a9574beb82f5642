//! src/bridge/mod.rs
//!
//! The per-task driver tying the pieces of a worker session together.
//!
//! One `compute` call owns one worker session and exactly three threads:
//! the calling thread consumes worker output through [`OutputFrames`], a
//! feeder thread pushes the task input, and a monitor thread watches for
//! cancellation. The calling thread exclusively reads the socket and the
//! feeder exclusively writes it. The monitor never touches the socket; it
//! only asks the pool to destroy the worker, which closes the socket and
//! unblocks the other two.
//!
//! # Session lifecycle
//! `compute` acquires a worker, spawns the feeder and monitor, registers a
//! completion hook with the task context, and returns the output iterator.
//! The hook runs when the framework completes the task: it stops the
//! feeder, joins both threads, and either releases the worker to the pool
//! (clean end-of-stream with pooling on) or destroys it.

pub(crate) mod feeder;
pub(crate) mod monitor;
pub(crate) mod reader;

pub use reader::OutputFrames;

use crate::accumulator::PickledAccumulator;
use crate::broadcast::Broadcast;
use crate::context::TaskContext;
use crate::host::HostRuntime;
use crate::record::Record;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// The upstream record stream for one partition.
pub type RecordStream = Box<dyn Iterator<Item = Record> + Send>;

/// Everything a worker needs to execute the user command.
pub struct WorkerCommand {
    /// Worker executable, also half of the pool key.
    pub executable: String,
    /// Worker environment, the other half of the pool key.
    pub env: HashMap<String, String>,
    /// Working directory announced in the task header.
    pub working_dir: String,
    /// Include-path entries announced in the task header.
    pub include_paths: Vec<String>,
    /// Opaque serialized user command.
    pub command: Vec<u8>,
    /// Broadcasts the task needs resident on the worker.
    pub broadcasts: Vec<Broadcast>,
}

/// One partition of input: its index plus the record stream.
pub struct Partition {
    pub index: i32,
    pub records: RecordStream,
}

impl Partition {
    pub fn new<I>(index: i32, records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: Send + 'static,
    {
        Self {
            index,
            records: Box::new(records.into_iter()),
        }
    }
}

/// State shared between the feeder, the reader, and the completion hook.
///
/// The feeder never lets an error escape its thread; it parks the error
/// here and half-closes the socket, and the reader consults the slot
/// before every read.
pub(crate) struct SessionState {
    feeder_error: Mutex<Option<Arc<anyhow::Error>>>,
    stop: AtomicBool,
    clean: AtomicBool,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            feeder_error: Mutex::new(None),
            stop: AtomicBool::new(false),
            clean: AtomicBool::new(false),
        }
    }

    /// First recorded error wins; later ones are side effects of the
    /// half-close.
    pub(crate) fn record_feeder_error(&self, err: anyhow::Error) {
        let mut slot = self.feeder_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(err));
        }
    }

    pub(crate) fn feeder_error(&self) -> Option<Arc<anyhow::Error>> {
        self.feeder_error.lock().unwrap().clone()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_clean(&self) {
        self.clean.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.clean.load(Ordering::SeqCst)
    }
}

/// Drives sidecar workers for the partitions of one logical operator.
pub struct TaskBridge {
    host: Arc<HostRuntime>,
    command: Arc<WorkerCommand>,
    accumulator: Arc<PickledAccumulator>,
}

impl TaskBridge {
    pub fn new(
        host: Arc<HostRuntime>,
        command: WorkerCommand,
        accumulator: Arc<PickledAccumulator>,
    ) -> Self {
        Self {
            host,
            command: Arc::new(command),
            accumulator,
        }
    }

    /// Runs the user command over one partition.
    ///
    /// Returns a lazy iterator of output byte strings. The iterator fails
    /// fast with a cancellation error once the context is cancelled; all
    /// other failures follow the session error taxonomy. Worker teardown
    /// happens in the completion hook, on every exit path the framework
    /// takes.
    pub fn compute(&self, partition: Partition, ctx: &TaskContext) -> Result<OutputFrames> {
        let Partition { index, records } = partition;
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let pool = Arc::clone(self.host.pool());
        let worker = pool.acquire(&self.command.executable, &self.command.env)?;
        let resident = pool.broadcasts_for(&worker);
        let session = Arc::new(SessionState::new());

        let halves = worker
            .clone_stream()
            .and_then(|w| worker.clone_stream().map(|r| (w, r)));
        let (write_half, read_half) = match halves {
            Ok(halves) => halves,
            Err(e) => {
                pool.destroy(&self.command.executable, &self.command.env, &worker);
                return Err(e).context("failed to clone worker socket for the session");
            }
        };

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let monitor_handle = match monitor::spawn(
            ctx.clone(),
            Arc::clone(&pool),
            Arc::clone(&self.command),
            Arc::clone(&worker),
            done_rx,
            index,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                pool.destroy(&self.command.executable, &self.command.env, &worker);
                return Err(e);
            }
        };

        let feeder_handle = match feeder::spawn(
            index,
            records,
            Arc::clone(&self.command),
            write_half,
            resident,
            Arc::clone(&session),
            Arc::clone(&self.host),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = done_tx.send(());
                let _ = monitor_handle.join();
                pool.destroy(&self.command.executable, &self.command.env, &worker);
                return Err(e);
            }
        };

        {
            let worker = Arc::clone(&worker);
            let pool = Arc::clone(&pool);
            let command = Arc::clone(&self.command);
            let session = Arc::clone(&session);
            let reuse = pool.reuse_enabled();
            ctx.add_completion_hook(move || {
                session.request_stop();
                if !session.is_clean() {
                    // Unblocks a feeder parked in a socket write.
                    let _ = worker.shutdown_write();
                }
                if feeder_handle.join().is_err() {
                    error!(partition = index, "feeder thread panicked");
                }
                let _ = done_tx.send(());
                if monitor_handle.join().is_err() {
                    error!(partition = index, "monitor thread panicked");
                }
                if reuse && session.is_clean() {
                    pool.release(&command.executable, &command.env, worker);
                } else {
                    pool.destroy(&command.executable, &command.env, &worker);
                }
            });
        }

        Ok(OutputFrames::new(
            read_half,
            ctx.clone(),
            Arc::clone(&self.host),
            session,
            Arc::clone(&self.accumulator),
            start_millis,
            index,
        ))
    }
}
