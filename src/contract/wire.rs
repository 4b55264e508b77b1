//! Versioned binary records
//!
//! Record format: [MAGIC][FORMAT_VERSION][LEN][PAYLOAD][CRC32]
//!
//! The payload is bincode; the checksum covers version, length and payload.
//! Fields may only be added at the end of a record, and doing so bumps
//! `FORMAT_VERSION`.

use crate::common::{crc32, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const RECORD_MAGIC: [u8; 4] = [0x54, 0x43, 0x52, 0x31]; // "TCR1"
pub const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4;
/// Largest payload a record header may announce.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Encode `value` as one framed record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_RECORD_LEN)
        .ok_or_else(|| Error::Corrupted(format!("record too large: {} bytes", payload.len())))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    out.extend_from_slice(&RECORD_MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    let checksum = crc32(&out[RECORD_MAGIC.len()..]);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Decode one record that fills `bytes` exactly.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut reader = bytes;
    let value = read_record(&mut reader)?
        .ok_or_else(|| Error::Corrupted("empty record".into()))?;
    if !reader.is_empty() {
        return Err(Error::Corrupted(format!(
            "{} trailing bytes after record",
            reader.len()
        )));
    }
    Ok(value)
}

/// Append one record to `writer`.
pub fn write_record<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    let bytes = encode(value)?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Internal(format!("write record: {}", e)))
}

/// Read the next record, or `None` at a clean end of stream.
pub fn read_record<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Corrupted("truncated record".into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Internal(format!("read record: {}", e))),
        }
    }
    if magic != RECORD_MAGIC {
        return Err(Error::Corrupted("bad record magic".into()));
    }

    let mut header = [0u8; HEADER_LEN - 4];
    read_exact(reader, &mut header)?;
    let version = header[0];
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(Error::Corrupted(format!("record length {} exceeds limit", len)));
    }

    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload)?;
    let mut checksum_bytes = [0u8; 4];
    read_exact(reader, &mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);

    let mut checked = Vec::with_capacity(header.len() + payload.len());
    checked.extend_from_slice(&header);
    checked.extend_from_slice(&payload);
    let actual = crc32(&checked);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(Some(bincode::deserialize(&payload)?))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::Corrupted("truncated record".into()),
        _ => Error::Internal(format!("read record: {}", e)),
    })
}
