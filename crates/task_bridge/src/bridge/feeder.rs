//! src/bridge/feeder.rs
//!
//! Background producer for the worker's input side.
//!
//! The feeder writes the task header (partition index, working directory,
//! include paths, broadcast delta, command blob), then the record stream,
//! then the end-of-data and end-of-stream markers, and flushes. It checks
//! the session stop flag between records, and on any failure it records
//! the error in the shared slot and half-closes the socket so the worker
//! sees EOF and the reader can observe the failure. Errors never unwind
//! out of the thread.

use crate::broadcast;
use crate::codec::{self, FrameWriter};
use crate::host::HostRuntime;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::warn;

use super::{RecordStream, SessionState, WorkerCommand};

pub(crate) fn spawn(
    partition_index: i32,
    records: RecordStream,
    command: Arc<WorkerCommand>,
    socket: TcpStream,
    resident: Arc<Mutex<HashSet<i64>>>,
    session: Arc<SessionState>,
    host: Arc<HostRuntime>,
) -> Result<JoinHandle<()>> {
    let buffer_size = host.config().io_buffer_size;
    thread::Builder::new()
        .name(format!("bridge-feeder-p{}", partition_index))
        .spawn(move || {
            let result = socket
                .try_clone()
                .context("failed to clone feeder socket handle")
                .and_then(|stream| {
                    let mut writer =
                        FrameWriter::new(BufWriter::with_capacity(buffer_size, stream));
                    write_session(
                        &mut writer,
                        partition_index,
                        records,
                        &command,
                        &resident,
                        &session,
                    )
                });
            if let Err(err) = result {
                warn!(partition = partition_index, "feeder failed: {:#}", err);
                session.record_feeder_error(err);
                let _ = socket.shutdown(Shutdown::Write);
            }
            // Reservations are keyed by this thread's identity, so the
            // releases must happen here, on every exit path.
            host.memory().release_shuffle_memory_for_current_thread();
            host.memory().release_unroll_memory_for_current_thread();
        })
        .context("failed to spawn feeder thread")
}

fn write_session<W: Write>(
    writer: &mut FrameWriter<W>,
    partition_index: i32,
    records: RecordStream,
    command: &WorkerCommand,
    resident: &Mutex<HashSet<i64>>,
    session: &SessionState,
) -> Result<()> {
    writer.write_i32(partition_index)?;
    writer.write_utf(&command.working_dir)?;
    writer.write_i32(command.include_paths.len() as i32)?;
    for path in &command.include_paths {
        writer.write_utf(path)?;
    }
    write_broadcast_delta(writer, command, resident)
        .context("failed to write broadcast delta")?;
    writer.write_frame(&command.command)?;
    write_records(writer, records, session)?;
    writer.write_i32(codec::END_OF_DATA_SECTION)?;
    writer.write_i32(codec::END_OF_STREAM)?;
    writer.flush()?;
    Ok(())
}

/// Emits the symmetric difference between the worker's resident set and the
/// task's broadcasts, mutating the resident set entry by entry so it always
/// matches what has actually been sent.
fn write_broadcast_delta<W: Write>(
    writer: &mut FrameWriter<W>,
    command: &WorkerCommand,
    resident: &Mutex<HashSet<i64>>,
) -> Result<()> {
    let mut resident = resident.lock().unwrap();
    let plan = broadcast::plan_delta(&resident, &command.broadcasts);
    writer.write_i32(plan.entry_count() as i32)?;
    for id in &plan.deregister {
        writer.write_i64(broadcast::encode_deregistration(*id))?;
        resident.remove(id);
    }
    for b in &plan.register {
        writer.write_i64(b.id)?;
        writer.write_frame(&b.payload)?;
        resident.insert(b.id);
    }
    Ok(())
}

fn write_records<W: Write>(
    writer: &mut FrameWriter<W>,
    mut records: RecordStream,
    session: &SessionState,
) -> Result<()> {
    let Some(first) = records.next() else {
        return Ok(());
    };
    // The first record fixes the encoding for the rest of the stream.
    let encoding = first.encoding();
    first.write_to(writer)?;
    for record in records {
        if session.stop_requested() {
            bail!("record stream interrupted by task completion");
        }
        if record.encoding() != encoding {
            bail!(
                "unexpected element type in record stream: started with {}, found {}",
                encoding.describe(),
                record.encoding().describe()
            );
        }
        record.write_to(writer)?;
    }
    Ok(())
}
