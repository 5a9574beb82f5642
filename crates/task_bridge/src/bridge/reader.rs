//! src/bridge/reader.rs
//!
//! Consumer side of a worker session: a lazy, non-restartable iterator
//! over the output byte strings, with the in-band control frames (timing,
//! exceptions, accumulator section, end-of-stream) handled between data
//! frames.

use crate::accumulator::PickledAccumulator;
use crate::codec::{self, FrameReader};
use crate::context::TaskContext;
use crate::error::BridgeError;
use crate::host::HostRuntime;
use std::io::{self, BufReader};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, warn};

use super::SessionState;

/// Output of one worker session.
///
/// Yields `Ok(frame)` per data frame the worker emits and ends after the
/// terminal end-of-stream frame. A `next()` call made after the task
/// context is cancelled fails fast with a cancellation error without
/// touching the socket. The iterator is fused: after an error or the end
/// of the stream it keeps returning `None`.
pub struct OutputFrames {
    reader: FrameReader<BufReader<TcpStream>>,
    ctx: TaskContext,
    host: Arc<HostRuntime>,
    session: Arc<SessionState>,
    accumulator: Arc<PickledAccumulator>,
    accumulated: Vec<Vec<u8>>,
    start_millis: i64,
    partition_index: i32,
    finished: bool,
}

enum Step {
    Frame(Vec<u8>),
    End,
    Fail(BridgeError),
    /// Host is shutting down; terminate without surfacing anything.
    Silent,
}

impl OutputFrames {
    pub(crate) fn new(
        stream: TcpStream,
        ctx: TaskContext,
        host: Arc<HostRuntime>,
        session: Arc<SessionState>,
        accumulator: Arc<PickledAccumulator>,
        start_millis: i64,
        partition_index: i32,
    ) -> Self {
        let buffer_size = host.config().io_buffer_size;
        Self {
            reader: FrameReader::new(BufReader::with_capacity(buffer_size, stream)),
            ctx,
            host,
            session,
            accumulator,
            accumulated: Vec::new(),
            start_millis,
            partition_index,
            finished: false,
        }
    }

    /// Accumulator updates merged locally (collecting-mode sink only).
    pub fn accumulated(&self) -> &[Vec<u8>] {
        &self.accumulated
    }

    fn advance(&mut self) -> Step {
        loop {
            // A feeder failure beats whatever the socket would say next.
            if let Some(err) = self.session.feeder_error() {
                return Step::Fail(BridgeError::WorkerInputFailure(err));
            }
            let len = match self.reader.read_i32() {
                Ok(len) => len,
                Err(e) => return self.read_failed(e, true),
            };
            if len >= 0 {
                return match self.reader.read_frame(len as usize) {
                    Ok(frame) => Step::Frame(frame),
                    Err(e) => self.read_failed(e, false),
                };
            }
            match len {
                codec::TIMING_DATA => {
                    if let Err(e) = self.record_timing() {
                        return self.read_failed(e, false);
                    }
                }
                codec::WORKER_EXCEPTION_THROWN => {
                    return match self.reader.read_utf() {
                        Ok(message) => Step::Fail(BridgeError::UserError {
                            message,
                            feeder: self.session.feeder_error(),
                        }),
                        Err(e) => self.read_failed(e, false),
                    };
                }
                codec::END_OF_DATA_SECTION => return self.finish_stream(),
                other => {
                    return Step::Fail(BridgeError::Protocol(format!(
                        "unknown control code {}",
                        other
                    )))
                }
            }
        }
    }

    fn record_timing(&mut self) -> io::Result<()> {
        let boot = self.reader.read_i64()?;
        let init = self.reader.read_i64()?;
        let finish = self.reader.read_i64()?;
        let memory_spilled = self.reader.read_i64()?;
        let disk_spilled = self.reader.read_i64()?;
        let metrics = self.ctx.metrics();
        metrics.add_memory_bytes_spilled(memory_spilled);
        metrics.add_disk_bytes_spilled(disk_spilled);
        debug!(
            partition = self.partition_index,
            boot = boot - self.start_millis,
            init = init - boot,
            finish = finish - init,
            "worker timing"
        );
        Ok(())
    }

    /// Accumulator section and terminal frame, after the data section.
    fn finish_stream(&mut self) -> Step {
        let count = match self.reader.read_i32() {
            Ok(count) => count,
            Err(e) => return self.read_failed(e, false),
        };
        if count < 0 {
            return Step::Fail(BridgeError::Protocol(format!(
                "negative accumulator batch size {}",
                count
            )));
        }
        let mut batch = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = match self.reader.read_i32() {
                Ok(len) => len,
                Err(e) => return self.read_failed(e, false),
            };
            if len < 0 {
                return Step::Fail(BridgeError::Protocol(format!(
                    "control code {} inside accumulator section",
                    len
                )));
            }
            match self.reader.read_frame(len as usize) {
                Ok(frame) => batch.push(frame),
                Err(e) => return self.read_failed(e, false),
            }
        }
        let local = std::mem::take(&mut self.accumulated);
        match self.accumulator.merge(local, batch) {
            Ok(local) => self.accumulated = local,
            Err(e) => return Step::Fail(e),
        }
        match self.reader.read_i32() {
            Ok(codec::END_OF_STREAM) => {
                self.session.mark_clean();
                Step::End
            }
            Ok(other) => Step::Fail(BridgeError::Protocol(format!(
                "expected end of stream, found {}",
                other
            ))),
            Err(e) => self.read_failed(e, false),
        }
    }

    /// Routes a failed socket read. `at_boundary` is true when the failure
    /// happened while reading a frame length, where a clean hang-up means
    /// the worker died; mid-frame it is a short read and a protocol error.
    fn read_failed(&mut self, err: io::Error, at_boundary: bool) -> Step {
        if self.host.is_shutting_down() {
            debug!(
                partition = self.partition_index,
                "worker read failed during host shutdown: {}", err
            );
            return Step::Silent;
        }
        if self.ctx.is_cancelled() {
            return Step::Fail(BridgeError::TaskCancelled);
        }
        if let Some(feeder) = self.session.feeder_error() {
            return Step::Fail(BridgeError::WorkerInputFailure(feeder));
        }
        if err.kind() == io::ErrorKind::UnexpectedEof {
            if at_boundary {
                warn!(
                    partition = self.partition_index,
                    "worker hung up before end of stream"
                );
                return Step::Fail(BridgeError::WorkerCrashed(err));
            }
            return Step::Fail(BridgeError::Protocol(
                "unexpected end of stream mid-frame".to_string(),
            ));
        }
        Step::Fail(BridgeError::Io(err))
    }
}

impl Iterator for OutputFrames {
    type Item = Result<Vec<u8>, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.ctx.is_cancelled() {
            self.finished = true;
            return Some(Err(BridgeError::TaskCancelled));
        }
        match self.advance() {
            Step::Frame(frame) => Some(Ok(frame)),
            Step::End | Step::Silent => {
                self.finished = true;
                None
            }
            Step::Fail(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
