//! src/record.rs
//!
//! Input records and their wire encodings.
//!
//! The framework's record type carries no static shape information, so the
//! feeder picks the encoding by peeking the first record of the stream and
//! holds every later record to the same shape. Pairs serialize as two
//! consecutive frames, key first.

use crate::codec::FrameWriter;
use std::io::{self, Write};

/// One upstream record handed to the feeder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Bytes(Vec<u8>),
    Text(String),
    BytesPair(Vec<u8>, Vec<u8>),
    TextPair(String, String),
}

/// The shape a record stream was locked to by its first element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordEncoding {
    Bytes,
    Text,
    BytesPair,
    TextPair,
}

impl RecordEncoding {
    pub fn describe(self) -> &'static str {
        match self {
            RecordEncoding::Bytes => "byte string",
            RecordEncoding::Text => "text string",
            RecordEncoding::BytesPair => "byte-string pair",
            RecordEncoding::TextPair => "text pair",
        }
    }
}

impl Record {
    pub fn encoding(&self) -> RecordEncoding {
        match self {
            Record::Bytes(_) => RecordEncoding::Bytes,
            Record::Text(_) => RecordEncoding::Text,
            Record::BytesPair(..) => RecordEncoding::BytesPair,
            Record::TextPair(..) => RecordEncoding::TextPair,
        }
    }

    pub(crate) fn write_to<W: Write>(&self, writer: &mut FrameWriter<W>) -> io::Result<()> {
        match self {
            Record::Bytes(bytes) => writer.write_frame(bytes),
            Record::Text(text) => writer.write_utf(text),
            Record::BytesPair(key, value) => {
                writer.write_frame(key)?;
                writer.write_frame(value)
            }
            Record::TextPair(key, value) => {
                writer.write_utf(key)?;
                writer.write_utf(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameReader;
    use std::io::Cursor;

    #[test]
    fn pair_records_emit_two_frames() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        {
            let mut w = FrameWriter::new(&mut buf);
            Record::BytesPair(b"k".to_vec(), b"value".to_vec()).write_to(&mut w)?;
        }
        let mut r = FrameReader::new(Cursor::new(buf));
        let len = r.read_i32()?;
        assert_eq!(r.read_frame(len as usize)?, b"k");
        let len = r.read_i32()?;
        assert_eq!(r.read_frame(len as usize)?, b"value");
        Ok(())
    }

    #[test]
    fn encoding_tracks_variant() {
        assert_eq!(
            Record::Text("x".into()).encoding(),
            RecordEncoding::Text
        );
        assert_ne!(
            Record::Bytes(vec![]).encoding(),
            Record::TextPair("a".into(), "b".into()).encoding()
        );
    }
}
