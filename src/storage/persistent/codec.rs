//! Framed record codec shared by every file the relay writes.
//!
//! Files start with a header naming what they contain, followed by frames:
//!
//! ```text
//! header: [MAGIC "CNST": 4 bytes][FORMAT: 1 byte][KIND: 1 byte]
//! frame:  [length: 4 bytes LE][payload: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! A frame cut short by a crash reads as a torn tail; a frame whose CRC
//! does not match reads as corruption. Readers stop at either.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Read, Result as IoResult, Seek, Write};
use std::path::Path;

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// On-disk format revision.
const FORMAT_VERSION: u8 = 1;

pub const MAGIC: [u8; 4] = *b"CNST";

/// Header length in bytes.
pub const HEADER_LEN: u64 = 6;

/// Frames above this size are rejected as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// What a framed file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Wal = 1,
    Cursor = 2,
    BusLog = 3,
}

impl FileKind {
    const fn tag(self) -> u8 {
        self as u8
    }
}

fn invalid(msg: impl Into<String>) -> IoError {
    IoError::new(ErrorKind::InvalidData, msg.into())
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encodes one frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(invalid(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len()).map_err(|_| invalid("frame length overflow"))?;

    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads one frame.
///
/// Returns `Ok(None)` at a clean end of file (no bytes left). A partially
/// written frame surfaces as `UnexpectedEof`, a checksum mismatch as
/// `InvalidData`.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<Option<T>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(IoError::new(ErrorKind::UnexpectedEof, "torn frame length")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!("frame of {len} bytes exceeds maximum {MAX_FRAME_LEN}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;

    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}")));
    }

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| invalid(format!("deserialization failed: {e}")))
}

pub fn write_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION, kind.tag()])
}

/// Reads and validates a header written for `expected`.
pub fn read_header(reader: &mut impl Read, expected: FileKind) -> IoResult<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(invalid(format!("invalid magic bytes: {:?}", &header[..4])));
    }
    if header[4] != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            header[4]
        )));
    }
    if header[5] != expected.tag() {
        return Err(invalid(format!(
            "file holds kind {} but {:?} was expected",
            header[5], expected
        )));
    }
    Ok(())
}

/// Records recovered from a framed file.
#[derive(Debug)]
pub struct Recovered<T> {
    pub records: Vec<T>,
    /// Bytes dropped from the tail (torn or corrupt frames).
    pub discarded_bytes: u64,
}

/// Opens (creating if needed) a framed file for appending.
///
/// Existing frames are read back; anything after the last intact frame is
/// truncated so new appends never land behind garbage.
pub fn open_append<T: DeserializeOwned>(
    path: &Path,
    kind: FileKind,
    sync: bool,
) -> IoResult<(File, Recovered<T>)> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN {
        file.set_len(0)?;
        write_header(&mut file, kind)?;
        if sync {
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        return Ok((
            file,
            Recovered {
                records: Vec::new(),
                discarded_bytes: 0,
            },
        ));
    }

    let mut reader = BufReader::new(file);
    read_header(&mut reader, kind)?;
    let mut records = Vec::new();
    let mut valid_len = HEADER_LEN;
    loop {
        match read_frame::<T>(&mut reader) {
            Ok(Some(record)) => {
                records.push(record);
                valid_len = reader.stream_position()?;
            }
            Ok(None) => break,
            Err(e) if matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::InvalidData) => {
                tracing::warn!(
                    path = %path.display(),
                    offset = valid_len,
                    error = %e,
                    "discarding damaged tail of framed file"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let file = reader.into_inner();
    let discarded_bytes = file_len.saturating_sub(valid_len);
    if discarded_bytes > 0 {
        file.set_len(valid_len)?;
        if sync {
            file.sync_all()?;
        }
    }
    drop(file);

    let file = OpenOptions::new().append(true).open(path)?;
    Ok((
        file,
        Recovered {
            records,
            discarded_bytes,
        },
    ))
}
