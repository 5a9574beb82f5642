//! src/error.rs
//!
//! Runtime error taxonomy for a worker session. Setup paths (construction,
//! spawning, configuration) use `anyhow` instead; this enum covers the
//! failures a consumer of the output iterator needs to tell apart.

use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker reported an exception from the user command.
    #[error("worker exception: {message}")]
    UserError {
        message: String,
        /// Feeder failure that may have provoked the worker-side error.
        feeder: Option<Arc<anyhow::Error>>,
    },

    /// The feeder failed to deliver the task input; the stored feeder
    /// exception is the root cause.
    #[error("failed to feed task input to worker: {0:#}")]
    WorkerInputFailure(Arc<anyhow::Error>),

    /// The worker hung up at a frame boundary without finishing the stream.
    #[error("worker exited unexpectedly before end of stream")]
    WorkerCrashed(#[source] io::Error),

    /// The task context was cancelled while the session was in flight.
    #[error("task cancelled")]
    TaskCancelled,

    /// Unknown control code, short read, or missing terminal frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The aggregator hung up before acknowledging a batch.
    #[error("aggregator closed the connection before the acknowledgement byte")]
    AggregatorProtocol,

    #[error("worker socket error")]
    Io(#[from] io::Error),
}
