//! src/accumulator.rs
//!
//! Sink for accumulator update batches produced by workers.
//!
//! Worker-side (no aggregator endpoint) the sink is a plain append.
//! Driver-side it forwards each batch over one lazily-opened TCP
//! connection and waits for a single acknowledgement byte: the sender
//! needs to know the aggregator holds the batch before the task can
//! report success, and nothing richer than one byte is required.

use crate::codec::FrameWriter;
use crate::error::BridgeError;
use std::io::{self, BufWriter, Read};
use std::net::TcpStream;
use std::sync::Mutex;
use tracing::debug;

enum Mode {
    /// Append batches to the caller's local list.
    Collecting,
    /// Forward batches to a remote aggregator.
    Forwarding { host: String, port: u16 },
}

/// Buffers or forwards opaque accumulator update frames.
pub struct PickledAccumulator {
    mode: Mode,
    conn: Mutex<Option<TcpStream>>,
}

impl PickledAccumulator {
    /// Worker-side sink: batches accumulate locally.
    pub fn collecting() -> Self {
        Self {
            mode: Mode::Collecting,
            conn: Mutex::new(None),
        }
    }

    /// Driver-side sink forwarding to `(host, port)`.
    pub fn forwarding(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: Mode::Forwarding {
                host: host.into(),
                port,
            },
            conn: Mutex::new(None),
        }
    }

    /// Merges `batch` into `local`.
    ///
    /// Collecting mode appends and returns the grown list. Forwarding mode
    /// leaves `local` untouched: it writes the batch count and frames to
    /// the aggregator, flushes, and blocks for exactly one ack byte. The
    /// connection is serialized by an internal lock and dropped on any
    /// failure so the next call reconnects.
    pub fn merge(
        &self,
        mut local: Vec<Vec<u8>>,
        batch: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, BridgeError> {
        match &self.mode {
            Mode::Collecting => {
                local.extend(batch);
                Ok(local)
            }
            Mode::Forwarding { host, port } => {
                let mut guard = self.conn.lock().unwrap();
                if guard.is_none() {
                    let stream = TcpStream::connect((host.as_str(), *port))?;
                    stream.set_nodelay(true)?;
                    debug!(host = %host, port, "connected to aggregator");
                    *guard = Some(stream);
                }
                let stream = guard.as_mut().expect("connection opened above");
                if let Err(e) = send_batch(stream, &batch) {
                    *guard = None;
                    return Err(e);
                }
                Ok(local)
            }
        }
    }
}

fn send_batch(stream: &mut TcpStream, batch: &[Vec<u8>]) -> Result<(), BridgeError> {
    {
        let mut writer = FrameWriter::new(BufWriter::new(stream.try_clone()?));
        writer.write_i32(batch.len() as i32)?;
        for frame in batch {
            writer.write_frame(frame)?;
        }
        writer.flush()?;
    }
    let mut ack = [0u8; 1];
    match stream.read_exact(&mut ack) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(BridgeError::AggregatorProtocol)
        }
        Err(e) => Err(BridgeError::Io(e)),
    }
}
