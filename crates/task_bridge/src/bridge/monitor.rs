//! src/bridge/monitor.rs
//!
//! Watchdog for one worker session. Cancellation cannot interrupt a thread
//! parked in a blocking socket read, so the monitor destroys the worker
//! instead; closing the socket is what unblocks the reader and feeder.

use crate::context::TaskContext;
use crate::pool::{Worker, WorkerPool};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

use super::WorkerCommand;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the watchdog. It wakes on the done signal or every poll
/// interval, exits once the task is completed, and destroys the worker if
/// it observes cancellation first. The task may complete between the two
/// flag checks and still get its worker destroyed; `destroy` is idempotent
/// so the double teardown is harmless.
pub(crate) fn spawn(
    ctx: TaskContext,
    pool: Arc<WorkerPool>,
    command: Arc<WorkerCommand>,
    worker: Arc<Worker>,
    done: Receiver<()>,
    partition_index: i32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("bridge-monitor-p{}", partition_index))
        .spawn(move || loop {
            match done.recv_timeout(POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.is_completed() {
                        break;
                    }
                    if ctx.is_cancelled() {
                        warn!(
                            partition = partition_index,
                            worker = worker.id(),
                            "task cancelled, destroying worker"
                        );
                        pool.destroy(&command.executable, &command.env, &worker);
                        break;
                    }
                }
            }
        })
        .context("failed to spawn monitor thread")
}
