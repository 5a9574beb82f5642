#![allow(dead_code)]

use task_bridge::codec::{self, FrameReader, FrameWriter};
use task_bridge::{
    BridgeConfig, HostRuntime, LocalStorage, MemoryManagers, Worker, WorkerLauncher,
};

use anyhow::Result;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Memory managers that count release calls instead of releasing anything.
#[derive(Default)]
pub struct RecordingMemory {
    pub shuffle_releases: AtomicUsize,
    pub unroll_releases: AtomicUsize,
}

impl MemoryManagers for RecordingMemory {
    fn release_shuffle_memory_for_current_thread(&self) {
        self.shuffle_releases.fetch_add(1, Ordering::SeqCst);
    }

    fn release_unroll_memory_for_current_thread(&self) {
        self.unroll_releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launcher that runs a scripted worker on a thread instead of spawning a
/// subprocess. Each launch connects a loopback pair and hands the peer end
/// to the script.
pub struct ThreadLauncher {
    script: Arc<dyn Fn(TcpStream) + Send + Sync>,
}

impl ThreadLauncher {
    pub fn new(script: impl Fn(TcpStream) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
        })
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, _executable: &str, env: &HashMap<String, String>) -> Result<Worker> {
        // The pool must always hand workers their scratch directories.
        assert!(env.contains_key("LOCAL_DIRS"), "LOCAL_DIRS missing from worker env");
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let peer = TcpStream::connect(listener.local_addr()?)?;
        let (stream, _) = listener.accept()?;
        let script = Arc::clone(&self.script);
        thread::Builder::new()
            .name("scripted-worker".to_string())
            .spawn(move || script(peer))?;
        Ok(Worker::attach(stream))
    }
}

/// Host runtime over a temp scratch directory and a recording memory
/// manager. The TempDir must outlive the test.
pub struct TestHost {
    pub host: Arc<HostRuntime>,
    pub memory: Arc<RecordingMemory>,
    _scratch: TempDir,
}

pub fn test_host(launcher: Arc<dyn WorkerLauncher>) -> TestHost {
    test_host_with_config(BridgeConfig::default(), launcher)
}

pub fn test_host_with_config(
    config: BridgeConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> TestHost {
    let scratch = TempDir::new().expect("temp scratch dir");
    let memory = Arc::new(RecordingMemory::default());
    let host = HostRuntime::with_launcher(
        config,
        LocalStorage::new(vec![scratch.path().to_path_buf()]),
        memory.clone(),
        launcher,
    );
    TestHost {
        host,
        memory,
        _scratch: scratch,
    }
}

/// One broadcast delta entry as decoded off the wire by a scripted worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaEntry {
    Deregister { id: i64, wire: i64 },
    Register { id: i64, payload: Vec<u8> },
}

/// Everything the feeder sends for one task session.
#[derive(Clone, Debug)]
pub struct SessionInput {
    pub partition: i32,
    pub working_dir: String,
    pub includes: Vec<String>,
    pub delta: Vec<DeltaEntry>,
    pub command: Vec<u8>,
    pub records: Vec<Vec<u8>>,
}

/// Parses one full session from the worker side of the socket. Returns
/// `None` on EOF before the header, which is how a pooled worker learns
/// the host is done with it.
pub fn read_session(reader: &mut FrameReader<TcpStream>) -> Option<SessionInput> {
    let partition = reader.read_i32().ok()?;
    let working_dir = reader.read_utf().expect("working dir frame");
    let include_count = reader.read_i32().expect("include count");
    let includes = (0..include_count)
        .map(|_| reader.read_utf().expect("include path frame"))
        .collect();
    let delta_count = reader.read_i32().expect("delta count");
    let delta = (0..delta_count)
        .map(|_| {
            let value = reader.read_i64().expect("delta entry");
            if value < 0 {
                DeltaEntry::Deregister {
                    id: -(value + 1),
                    wire: value,
                }
            } else {
                let len = reader.read_i32().expect("broadcast payload length");
                DeltaEntry::Register {
                    id: value,
                    payload: reader.read_frame(len as usize).expect("broadcast payload"),
                }
            }
        })
        .collect();
    let command_len = reader.read_i32().expect("command length");
    let command = reader.read_frame(command_len as usize).expect("command blob");

    let mut records = Vec::new();
    loop {
        let len = reader.read_i32().expect("record frame length");
        if len == codec::END_OF_DATA_SECTION {
            break;
        }
        assert!(len >= 0, "unexpected control code {} in record stream", len);
        records.push(reader.read_frame(len as usize).expect("record frame"));
    }
    let terminal = reader.read_i32().expect("terminal input frame");
    assert_eq!(terminal, codec::END_OF_STREAM);

    Some(SessionInput {
        partition,
        working_dir,
        includes,
        delta,
        command,
        records,
    })
}

/// Standard happy-path worker: echoes every record back uppercased, then
/// closes the session cleanly with an empty accumulator section. Serves
/// sessions until the host hangs up.
pub fn uppercase_echo_script(stream: TcpStream) {
    let mut reader = FrameReader::new(stream.try_clone().expect("clone worker stream"));
    let mut writer = FrameWriter::new(stream);
    while let Some(session) = read_session(&mut reader) {
        for record in &session.records {
            let upper: Vec<u8> = record.iter().map(|b| b.to_ascii_uppercase()).collect();
            writer.write_frame(&upper).expect("write reply frame");
        }
        finish_session(&mut writer, &[]);
    }
}

/// Writes the end of a clean session: end-of-data, the accumulator batch,
/// and the terminal end-of-stream frame.
pub fn finish_session(writer: &mut FrameWriter<TcpStream>, accumulator: &[Vec<u8>]) {
    writer
        .write_i32(codec::END_OF_DATA_SECTION)
        .expect("end of data section");
    writer
        .write_i32(accumulator.len() as i32)
        .expect("accumulator count");
    for update in accumulator {
        writer.write_frame(update).expect("accumulator frame");
    }
    writer.write_i32(codec::END_OF_STREAM).expect("end of stream");
    writer.flush().expect("flush session");
}

pub fn bytes(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}
