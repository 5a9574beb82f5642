//! src/codec.rs
//!
//! Length-prefixed frame codec shared by the worker socket, the aggregator
//! connection, and the on-disk frame files.
//!
//! A frame is a signed 32-bit big-endian length `n >= 0` followed by exactly
//! `n` payload bytes. Negative lengths are in-band control codes; their typed
//! payloads are read by the caller. All multi-byte integers on the wire are
//! signed big-endian. There is no magic header and no version negotiation.

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Worker has finished emitting data records.
pub const END_OF_DATA_SECTION: i32 = -1;
/// Followed by one UTF-8 frame carrying the error message.
pub const WORKER_EXCEPTION_THROWN: i32 = -2;
/// Followed by five i64 values: boot, init, finish, memory spilled, disk spilled.
pub const TIMING_DATA: i32 = -3;
/// Terminal frame of a session, after the accumulator section.
pub const END_OF_STREAM: i32 = -4;

/// Writing half of the codec over any byte sink.
///
/// Callers wrap the sink in a `BufWriter` sized by `io.buffer.size`; the
/// codec itself never buffers.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.inner.write_i32::<BigEndian>(value)
    }

    pub fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.inner.write_i64::<BigEndian>(value)
    }

    /// One data frame: length prefix plus payload.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_i32(payload.len() as i32)?;
        self.inner.write_all(payload)
    }

    /// A UTF-8 string as one data frame.
    pub fn write_utf(&mut self, value: &str) -> io::Result<()> {
        self.write_frame(value.as_bytes())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reading half of the codec over any byte source.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        self.inner.read_i32::<BigEndian>()
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        self.inner.read_i64::<BigEndian>()
    }

    /// Reads exactly `len` payload bytes; a short read surfaces as
    /// `UnexpectedEof`.
    pub fn read_frame(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads one length-prefixed UTF-8 frame.
    pub fn read_utf(&mut self) -> io::Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a UTF-8 frame, found control code {}", len),
            ));
        }
        let bytes = self.read_frame(len as usize)?;
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Writes every frame in `frames` to a new file at `path`.
///
/// The file shares the wire framing; it carries no header and no checksum,
/// and plain EOF terminates it.
pub fn write_frames_to_file<I, P>(frames: I, path: P) -> Result<()>
where
    I: IntoIterator<Item = Vec<u8>>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("failed to create frame file {}", path.display()))?;
    let mut writer = FrameWriter::new(BufWriter::new(file));
    for frame in frames {
        writer
            .write_frame(&frame)
            .with_context(|| format!("failed to write frame to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush frame file {}", path.display()))?;
    Ok(())
}

/// Lazily reads frames back from a file written by [`write_frames_to_file`].
///
/// EOF at a frame boundary ends the iteration; a truncated frame is an error.
pub fn read_frames_from_file<P: AsRef<Path>>(path: P) -> Result<FrameFileReader> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open frame file {}", path.display()))?;
    Ok(FrameFileReader {
        reader: FrameReader::new(BufReader::new(file)),
    })
}

/// Reads the single data frame a broadcast payload file holds.
pub fn read_single_frame_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut frames = read_frames_from_file(path)?;
    frames
        .next()
        .ok_or_else(|| anyhow!("broadcast file {} is empty", path.display()))?
}

/// Iterator over the frames of an on-disk frame file.
pub struct FrameFileReader {
    reader: FrameReader<BufReader<File>>,
}

impl Iterator for FrameFileReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.reader.read_i32() {
            Ok(len) => len,
            // EOF between frames is the normal terminator.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e).context("failed to read frame length")),
        };
        if len < 0 {
            return Some(Err(anyhow!(
                "unexpected control code {} in frame file",
                len
            )));
        }
        Some(
            self.reader
                .read_frame(len as usize)
                .context("frame file truncated mid-frame"),
        )
    }
}
