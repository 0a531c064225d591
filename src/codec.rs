//! On-disk framing for one-block payloads and merged bundles.
//!
//! A one-block payload is a fixed-length file header followed by exactly one
//! block record. A merged bundle is the same header followed by the records
//! of every bundled block, which is what lets the bundle reader concatenate
//! payloads by stripping the repeated header off every file but the first.

use chrono::{DateTime, NaiveDateTime};
use crc32fast::Hasher;
use eyre::{bail, eyre, Result};

/// Length of the file header carried by every one-block payload.
pub const HEADER_LEN: usize = 10;

const MAGIC: &[u8; 4] = b"1blk";
const VERSION: u16 = 1;

/// A decoded block record: identity metadata plus the opaque block bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_num: u64,
    pub lib_num: u64,
    pub block_time: NaiveDateTime,
    pub block_id: String,
    pub previous_id: String,
    pub payload: Vec<u8>,
}

pub fn write_header(out: &mut Vec<u8>) {
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
}

pub fn check_header(data: &[u8]) -> Result<()> {
    if data.len() < HEADER_LEN {
        bail!(
            "payload too short for header: {} bytes, expected at least {HEADER_LEN}",
            data.len()
        );
    }
    if &data[..4] != MAGIC {
        bail!("bad magic bytes {:02x?}", &data[..4]);
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        bail!("unsupported payload version {version}");
    }
    Ok(())
}

pub fn encode_record(record: &BlockRecord, out: &mut Vec<u8>) {
    let micros = record.block_time.and_utc().timestamp_micros();
    let id = record.block_id.as_bytes();
    let previous = record.previous_id.as_bytes();

    let start = out.len();
    out.extend_from_slice(&record.block_num.to_le_bytes());
    out.extend_from_slice(&record.lib_num.to_le_bytes());
    out.extend_from_slice(&micros.to_le_bytes());
    out.extend_from_slice(&(id.len() as u16).to_le_bytes());
    out.extend_from_slice(&(previous.len() as u16).to_le_bytes());
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(previous);
    out.extend_from_slice(&record.payload);

    let mut hasher = Hasher::new();
    hasher.update(&out[start..]);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
}

/// Encode a complete one-block payload (header plus a single record).
pub fn encode_one_block_payload(record: &BlockRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64 + record.payload.len());
    write_header(&mut out);
    encode_record(record, &mut out);
    out
}

/// Decode every record of a merged bundle body (the bytes after the header).
///
/// Unlike a write-ahead log, a merged bundle is written atomically; any
/// truncation or checksum mismatch is corruption, not a partial tail.
pub fn decode_records(body: &[u8]) -> Result<Vec<BlockRecord>> {
    let mut records = Vec::new();
    let mut cursor = 0usize;
    while cursor < body.len() {
        let (record, next) = decode_record_at(body, cursor)?;
        records.push(record);
        cursor = next;
    }
    Ok(records)
}

fn decode_record_at(body: &[u8], start: usize) -> Result<(BlockRecord, usize)> {
    const FIXED: usize = 8 + 8 + 8 + 2 + 2 + 4;

    let remaining = &body[start..];
    if remaining.len() < FIXED {
        bail!("truncated record at offset {start}");
    }
    let block_num = u64::from_le_bytes(remaining[0..8].try_into()?);
    let lib_num = u64::from_le_bytes(remaining[8..16].try_into()?);
    let micros = i64::from_le_bytes(remaining[16..24].try_into()?);
    let id_len = u16::from_le_bytes(remaining[24..26].try_into()?) as usize;
    let previous_len = u16::from_le_bytes(remaining[26..28].try_into()?) as usize;
    let payload_len = u32::from_le_bytes(remaining[28..32].try_into()?) as usize;

    let body_len = FIXED + id_len + previous_len + payload_len;
    if remaining.len() < body_len + 4 {
        bail!("truncated record for block {block_num} at offset {start}");
    }

    let mut hasher = Hasher::new();
    hasher.update(&remaining[..body_len]);
    let expected = u32::from_le_bytes(remaining[body_len..body_len + 4].try_into()?);
    if hasher.finalize() != expected {
        bail!("checksum mismatch for block {block_num} at offset {start}");
    }

    let block_time = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| eyre!("invalid block time for block {block_num}"))?
        .naive_utc();
    let id_start = FIXED;
    let previous_start = id_start + id_len;
    let payload_start = previous_start + previous_len;
    let record = BlockRecord {
        block_num,
        lib_num,
        block_time,
        block_id: String::from_utf8(remaining[id_start..previous_start].to_vec())?,
        previous_id: String::from_utf8(remaining[previous_start..payload_start].to_vec())?,
        payload: remaining[payload_start..body_len].to_vec(),
    };
    Ok((record, start + body_len + 4))
}
