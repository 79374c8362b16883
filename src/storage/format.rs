//! `PBTC` binary container
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [4]  magic "PBTC"
//! u32  version (1)
//! u32  entry count
//! per entry:
//!   u32 len + bytes  test name
//!   u32 len + bytes  property name
//!   u32 len + bytes  compressed payload
//!   u32 len + bytes  error message
//!   i64              timestamp, ms since the Unix epoch
//!   u64              original size
//!   u64              compressed size
//!   u32 len + bytes  compression algorithm name
//! ```
//!
//! Entry metadata is not part of the container. Reading is all-or-nothing: any
//! structural problem fails the whole read and no entries are returned.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::database::CounterexampleEntry;
use super::{DatabaseError, DatabaseResult};

pub const FORMAT_MAGIC: &[u8; 4] = b"PBTC";
pub const FORMAT_VERSION: u32 = 1;

/// Serialize `entries` into a complete container
pub fn encode(entries: &[CounterexampleEntry]) -> DatabaseResult<Vec<u8>> {
    let mut buffer = Vec::new();
    write_container(&mut buffer, entries)?;
    Ok(buffer)
}

pub fn write_container<W: Write>(writer: &mut W, entries: &[CounterexampleEntry]) -> DatabaseResult<()> {
    let count = u32::try_from(entries.len())
        .map_err(|_| DatabaseError::InvalidFormat(format!("too many entries: {}", entries.len())))?;

    writer.write_all(FORMAT_MAGIC)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u32::<LittleEndian>(count)?;

    for entry in entries {
        write_bytes(writer, entry.test_name.as_bytes())?;
        write_bytes(writer, entry.property_name.as_bytes())?;
        write_bytes(writer, &entry.compressed_data)?;
        write_bytes(writer, entry.error_message.as_bytes())?;
        writer.write_i64::<LittleEndian>(to_millis(entry.timestamp))?;
        writer.write_u64::<LittleEndian>(entry.original_size)?;
        writer.write_u64::<LittleEndian>(entry.compressed_size)?;
        write_bytes(writer, entry.compression_algorithm.as_bytes())?;
    }

    Ok(())
}

/// Parse a complete container
pub fn decode(data: &[u8]) -> DatabaseResult<Vec<CounterexampleEntry>> {
    let mut cursor = Cursor::new(data);

    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| DatabaseError::InvalidFormat("file too short for header".to_string()))?;
    if &magic != FORMAT_MAGIC {
        return Err(DatabaseError::InvalidFormat(format!(
            "bad magic number {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }

    let version = read_u32(&mut cursor, "version")?;
    if version != FORMAT_VERSION {
        return Err(DatabaseError::UnsupportedVersion(version));
    }

    let count = read_u32(&mut cursor, "entry count")? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));

    for index in 0..count {
        let entry = read_entry(&mut cursor)
            .map_err(|e| DatabaseError::InvalidFormat(format!("entry {}: {}", index, e)))?;
        entries.push(entry);
    }

    Ok(entries)
}

fn read_entry(cursor: &mut Cursor<&[u8]>) -> Result<CounterexampleEntry, String> {
    let test_name = read_string(cursor, "test name")?;
    let property_name = read_string(cursor, "property name")?;
    let compressed_data = read_bytes(cursor, "payload")?;
    let error_message = read_string(cursor, "error message")?;
    let timestamp = cursor
        .read_i64::<LittleEndian>()
        .map_err(|_| "truncated timestamp".to_string())?;
    let original_size = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| "truncated original size".to_string())?;
    let compressed_size = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| "truncated compressed size".to_string())?;
    let compression_algorithm = read_string(cursor, "compression algorithm")?;

    Ok(CounterexampleEntry {
        test_name,
        property_name,
        compressed_data,
        error_message,
        timestamp: from_millis(timestamp),
        original_size,
        compressed_size,
        compression_algorithm,
        metadata: BTreeMap::new(),
    })
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> DatabaseResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| DatabaseError::InvalidFormat(format!("field too large: {} bytes", bytes.len())))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_u32(cursor: &mut Cursor<&[u8]>, field: &str) -> DatabaseResult<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| DatabaseError::InvalidFormat(format!("truncated {}", field)))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, field: &str) -> Result<Vec<u8>, String> {
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| format!("truncated {} length", field))? as usize;

    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(format!("{} length {} exceeds remaining {} bytes", field, len, remaining));
    }

    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| format!("truncated {}", field))?;
    Ok(bytes)
}

fn read_string(cursor: &mut Cursor<&[u8]>, field: &str) -> Result<String, String> {
    let bytes = read_bytes(cursor, field)?;
    String::from_utf8(bytes).map_err(|_| format!("{} is not valid UTF-8", field))
}

/// Signed milliseconds since the Unix epoch
pub(crate) fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

fn from_millis(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}
