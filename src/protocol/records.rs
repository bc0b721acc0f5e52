use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RecordHint {
    End = 0,
    Packet = 1,
    SyncedObject = 2,
}

/// hint byte + skip distance
pub const RECORD_HEADER_LEN: usize = 5;

/// Builds the multiplexed record stream of a single data frame
pub struct RecordWriter {
    buf: BytesMut,
    num_records: usize,
}
impl Default for RecordWriter {
    fn default() -> Self {
        RecordWriter::new()
    }
}
impl RecordWriter {
    pub fn new() -> RecordWriter {
        RecordWriter {
            buf: BytesMut::new(),
            num_records: 0,
        }
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    /// the serialized length including the terminating hint
    pub fn finished_len(&self) -> usize {
        self.buf.len() + 1
    }

    /// Appends an already serialized payload with an arbitrary hint byte. Payloads are bounded
    ///  by the datagram size, so their length always fits the skip distance.
    pub fn append_raw(&mut self, hint: u8, payload: &[u8]) {
        debug_assert!(payload.len() <= i32::MAX as usize);
        self.buf.put_u8(hint);
        self.buf.put_i32(payload.len() as i32);
        self.buf.put_slice(payload);
        self.num_records += 1;
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(RecordHint::End.into());
        self.buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Record<'a> {
    pub hint: u8,
    pub payload: &'a [u8],
}
impl Record<'_> {
    pub fn kind(&self) -> Option<RecordHint> {
        RecordHint::try_from(self.hint).ok()
    }
}

/// Iterates the records of a data frame. Every record with intact framing is yielded, including
///  those with unknown hints: decoding is the caller's business, and a record that fails to
///  decode does not affect the position of the next one.
///
/// Iteration ends at the terminating hint, or when the framing itself is broken (truncated header
///  or a skip distance pointing outside the datagram) since there is no way to resynchronize then.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    done: bool,
}
impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> RecordReader<'a> {
        RecordReader { buf, done: false }
    }
}
impl<'a> Iterator for RecordReader<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        if self.done {
            return None;
        }
        if self.buf.is_empty() {
            debug!("record stream without terminator");
            self.done = true;
            return None;
        }

        let hint = self.buf.get_u8();
        if hint == u8::from(RecordHint::End) {
            if !self.buf.is_empty() {
                debug!("{} trailing bytes after record stream terminator", self.buf.len());
            }
            self.done = true;
            return None;
        }

        if self.buf.remaining() < 4 {
            warn!("truncated record header - dropping rest of datagram");
            self.done = true;
            return None;
        }
        let skip_distance = self.buf.get_i32();
        let len = match usize::try_from(skip_distance) {
            Ok(len) if len <= self.buf.len() => len,
            _ => {
                warn!("invalid skip distance {} with {} bytes remaining - dropping rest of datagram", skip_distance, self.buf.len());
                self.done = true;
                return None;
            }
        };

        let (payload, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(Record { hint, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_write_read() {
        let mut writer = RecordWriter::new();
        writer.append_raw(RecordHint::Packet.into(), &[1, 2, 3]);
        writer.append_raw(RecordHint::SyncedObject.into(), &[]);
        writer.append_raw(RecordHint::Packet.into(), &[0xab, 0xcd]);
        assert_eq!(3, writer.num_records());
        assert_eq!(3 * RECORD_HEADER_LEN + 5 + 1, writer.finished_len());

        let data = writer.finish();
        assert_eq!(&data[..8], &[1, 0, 0, 0, 3, 1, 2, 3]);
        assert_eq!(Some(&0), data.last());

        let records = RecordReader::new(&data).collect::<Vec<_>>();
        assert_eq!(vec![
            Record { hint: 1, payload: &[1, 2, 3] },
            Record { hint: 2, payload: &[] },
            Record { hint: 1, payload: &[0xab, 0xcd] },
        ], records);
        assert_eq!(Some(RecordHint::SyncedObject), records[1].kind());
    }

    #[test]
    fn test_empty_stream() {
        let data = RecordWriter::new().finish();
        assert_eq!(&[0u8], data.as_ref());
        assert_eq!(0, RecordReader::new(&data).count());
    }

    #[test]
    fn test_unknown_hint_is_yielded_and_skipped() {
        let mut writer = RecordWriter::new();
        writer.append_raw(RecordHint::Packet.into(), &[1]);
        writer.append_raw(77, &[9, 9, 9, 9]);
        writer.append_raw(RecordHint::Packet.into(), &[2]);
        let data = writer.finish();

        let records = RecordReader::new(&data).collect::<Vec<_>>();
        assert_eq!(3, records.len());
        assert_eq!(None, records[1].kind());
        assert_eq!(&[2], records[2].payload);
    }

    #[rstest]
    #[case::negative_skip(vec![1, 0xff, 0xff, 0xff, 0xff, 0])]
    #[case::skip_beyond_end(vec![1, 0, 0, 0, 10, 1, 2, 0])]
    #[case::truncated_header(vec![1, 0, 0])]
    #[case::missing_terminator(vec![])]
    fn test_broken_framing_stops(#[case] data: Vec<u8>) {
        assert_eq!(0, RecordReader::new(&data).count());
    }

    #[test]
    fn test_records_before_broken_framing_survive() {
        let mut writer = RecordWriter::new();
        writer.append_raw(RecordHint::Packet.into(), &[1]);
        let mut data = writer.finish().to_vec();
        data.pop();
        data.extend_from_slice(&[1, 0, 0, 0, 100, 5]);

        let records = RecordReader::new(&data).collect::<Vec<_>>();
        assert_eq!(vec![Record { hint: 1, payload: &[1] }], records);
    }
}
