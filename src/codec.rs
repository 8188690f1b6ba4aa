//! Binary layout for log records (data files) and hint records (hint files).
//!
//! Records are big-endian, contiguous, and unpadded:
//!
//! ```text
//! data:  timestamp(8) | ksize(8) | vsize(8) | key[k] | value[v]
//! hint:  timestamp(8) | ksize(8) | vsize(8) | vpos(8) | key[k]
//! ```
//!
//! `vsize == -1` marks a tombstone: no value bytes follow in a data record,
//! and `vpos` is meaningless in a hint record.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::error::{Error, Result};

/// Header size shared by every data record: timestamp + ksize + vsize.
const RECORD_HEADER_LEN: u64 = 24;

/// Header size shared by every hint record: timestamp + ksize + vsize + vpos.
const HINT_HEADER_LEN: u64 = 32;

/// Ceilings enforced by the codec so a corrupt or hostile header can't make the
/// engine allocate an unbounded buffer.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_key_size: u64,
    pub max_value_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key_size: 64 * 1024,
            max_value_size: 1024 * 1024 * 1024,
        }
    }
}

/// The decoded value half of a record: either live bytes or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Live(Bytes),
    Tombstone,
}

impl Payload {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }
}

/// A fully decoded data record, including the value bytes.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Bytes,
    pub payload: Payload,
    pub timestamp: i64,
    /// Offset of the value within the segment (meaningful even for tombstones,
    /// matching the convention used by hint records).
    pub value_pos: u64,
    /// Total bytes this record occupies on disk.
    pub len: u64,
}

/// A record decoded without materialising the value, used during recovery.
#[derive(Debug, Clone)]
pub struct SkippedRecord {
    pub key: Bytes,
    pub timestamp: i64,
    /// `-1` for tombstones, else the value length.
    pub value_size: i64,
    pub value_pos: u64,
    pub len: u64,
}

/// A decoded hint record.
#[derive(Debug, Clone)]
pub struct Hint {
    pub key: Bytes,
    pub timestamp: i64,
    /// `-1` for tombstones.
    pub value_size: i64,
    pub value_pos: u64,
    pub len: u64,
}

/// The byte offset at which `value` begins for a record of this shape, given
/// the offset the record itself starts at.
pub fn value_offset(record_start: u64, key_len: u64) -> u64 {
    record_start + RECORD_HEADER_LEN + key_len
}

/// Encodes a `set` (`value = Some(..)`) or `delete` (`value = None`) record.
pub fn encode_record(key: &[u8], value: Option<&[u8]>, timestamp: i64) -> Vec<u8> {
    let ksize = key.len() as i64;
    let vsize = value.map(|v| v.len() as i64).unwrap_or(-1);

    let mut buf = Vec::with_capacity(
        RECORD_HEADER_LEN as usize + key.len() + value.map(<[u8]>::len).unwrap_or(0),
    );
    buf.write_i64::<BigEndian>(timestamp).expect("vec write");
    buf.write_i64::<BigEndian>(ksize).expect("vec write");
    buf.write_i64::<BigEndian>(vsize).expect("vec write");
    buf.extend_from_slice(key);
    if let Some(value) = value {
        buf.extend_from_slice(value);
    }
    buf
}

/// Encodes a hint record summarising a data record at `value_pos`.
pub fn encode_hint(key: &[u8], timestamp: i64, value_size: i64, value_pos: i64) -> Vec<u8> {
    let ksize = key.len() as i64;
    let mut buf = Vec::with_capacity(HINT_HEADER_LEN as usize + key.len());
    buf.write_i64::<BigEndian>(timestamp).expect("vec write");
    buf.write_i64::<BigEndian>(ksize).expect("vec write");
    buf.write_i64::<BigEndian>(value_size).expect("vec write");
    buf.write_i64::<BigEndian>(value_pos).expect("vec write");
    buf.extend_from_slice(key);
    buf
}

/// Reads exactly `buf.len()` bytes, distinguishing a clean EOF (nothing read
/// yet) from a short read partway through a record.
fn fill_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                if read == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short record header"));
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

struct Header {
    timestamp: i64,
    ksize: i64,
    vsize: i64,
}

fn read_header<R: Read>(
    reader: &mut R,
    header_len: u64,
    segment_id: u64,
    offset: u64,
) -> Result<Option<Header>> {
    let mut buf = vec![0u8; header_len as usize];
    if !fill_or_eof(reader, &mut buf).map_err(|e| io_to_corrupt(e, segment_id, offset))? {
        return Ok(None);
    }
    let mut cur = &buf[..];
    let timestamp = cur.read_i64::<BigEndian>().expect("slice read");
    let ksize = cur.read_i64::<BigEndian>().expect("slice read");
    let vsize = cur.read_i64::<BigEndian>().expect("slice read");
    Ok(Some(Header { timestamp, ksize, vsize }))
}

fn io_to_corrupt(e: io::Error, segment_id: u64, offset: u64) -> Error {
    Error::corrupt(segment_id, offset, e.to_string())
}

fn validate_sizes(ksize: i64, vsize: i64, limits: &Limits, segment_id: u64, offset: u64) -> Result<()> {
    if ksize < 0 {
        return Err(Error::corrupt(segment_id, offset, format!("negative key size {ksize}")));
    }
    if vsize < -1 {
        return Err(Error::corrupt(segment_id, offset, format!("invalid value size {vsize}")));
    }
    if ksize as u64 > limits.max_key_size {
        return Err(Error::corrupt(
            segment_id,
            offset,
            format!("key size {ksize} exceeds configured ceiling {}", limits.max_key_size),
        ));
    }
    if vsize > 0 && vsize as u64 > limits.max_value_size {
        return Err(Error::corrupt(
            segment_id,
            offset,
            format!("value size {vsize} exceeds configured ceiling {}", limits.max_value_size),
        ));
    }
    Ok(())
}

/// Decodes one data record, fully materialising its value. Returns `Ok(None)`
/// at a clean end of stream (no partial record pending).
pub fn decode_record<R: Read>(
    reader: &mut R,
    segment_id: u64,
    offset: u64,
    limits: &Limits,
) -> Result<Option<Record>> {
    let header = match read_header(reader, RECORD_HEADER_LEN, segment_id, offset)? {
        Some(h) => h,
        None => return Ok(None),
    };
    validate_sizes(header.ksize, header.vsize, limits, segment_id, offset)?;

    let mut key = vec![0u8; header.ksize as usize];
    reader
        .read_exact(&mut key)
        .map_err(|e| Error::corrupt(segment_id, offset, format!("short key read: {e}")))?;

    let value_pos = value_offset(offset, header.ksize as u64);
    let payload = if header.vsize < 0 {
        Payload::Tombstone
    } else {
        let mut value = vec![0u8; header.vsize as usize];
        reader
            .read_exact(&mut value)
            .map_err(|e| Error::corrupt(segment_id, offset, format!("short value read: {e}")))?;
        Payload::Live(Bytes::from(value))
    };

    let len = RECORD_HEADER_LEN + header.ksize as u64 + header.vsize.max(0) as u64;
    Ok(Some(Record {
        key: Bytes::from(key),
        payload,
        timestamp: header.timestamp,
        value_pos,
        len,
    }))
}

/// Decodes one data record without reading its value bytes into memory,
/// advancing the stream by seeking past the value instead of copying it. Used
/// by recovery, which only needs `(key, timestamp, value_size, value_pos)`.
pub fn decode_record_skip_value<R: Read + Seek>(
    reader: &mut R,
    segment_id: u64,
    offset: u64,
    limits: &Limits,
) -> Result<Option<SkippedRecord>> {
    let header = match read_header(reader, RECORD_HEADER_LEN, segment_id, offset)? {
        Some(h) => h,
        None => return Ok(None),
    };
    validate_sizes(header.ksize, header.vsize, limits, segment_id, offset)?;

    let mut key = vec![0u8; header.ksize as usize];
    reader
        .read_exact(&mut key)
        .map_err(|e| Error::corrupt(segment_id, offset, format!("short key read: {e}")))?;

    let value_pos = value_offset(offset, header.ksize as u64);
    if header.vsize > 0 {
        reader
            .seek(SeekFrom::Current(header.vsize))
            .map_err(|e| Error::corrupt(segment_id, offset, format!("failed to skip value: {e}")))?;
    }

    let len = RECORD_HEADER_LEN + header.ksize as u64 + header.vsize.max(0) as u64;
    Ok(Some(SkippedRecord {
        key: Bytes::from(key),
        timestamp: header.timestamp,
        value_size: header.vsize,
        value_pos,
        len,
    }))
}

/// Decodes one hint record.
pub fn decode_hint<R: Read>(
    reader: &mut R,
    segment_id: u64,
    offset: u64,
    limits: &Limits,
) -> Result<Option<Hint>> {
    let mut buf = [0u8; HINT_HEADER_LEN as usize];
    if !fill_or_eof(reader, &mut buf).map_err(|e| io_to_corrupt(e, segment_id, offset))? {
        return Ok(None);
    }
    let mut cur = &buf[..];
    let timestamp = cur.read_i64::<BigEndian>().expect("slice read");
    let ksize = cur.read_i64::<BigEndian>().expect("slice read");
    let vsize = cur.read_i64::<BigEndian>().expect("slice read");
    let vpos = cur.read_i64::<BigEndian>().expect("slice read");
    validate_sizes(ksize, vsize, limits, segment_id, offset)?;

    let mut key = vec![0u8; ksize as usize];
    reader
        .read_exact(&mut key)
        .map_err(|e| Error::corrupt(segment_id, offset, format!("short key read: {e}")))?;

    let len = HINT_HEADER_LEN + ksize as u64;
    Ok(Some(Hint {
        key: Bytes::from(key),
        timestamp,
        value_size: vsize,
        value_pos: vpos.max(0) as u64,
        len,
    }))
}
