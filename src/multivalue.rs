//! Component D: cursor-paginated emission of NUL-separated string lists
//! (§4.D, §6 "Multi-value cursor encoding").
//!
//! Grounded on other_examples softprops-fasttime's `header_names_get` /
//! `header_values_get`, which write one NUL-terminated name per call and
//! advance the cursor by one list index. This module generalizes that to
//! the byte-offset cursor contract described here: the list
//! is serialized once as `v0\0v1\0...vk\0` and the cursor is a byte
//! offset into that serialized blob, not a list index, so a single call
//! can emit more than one value when they fit in the guest's buffer.

use crate::error::XqdError;
use crate::memory::MemoryView;

/// Sentinel cursor value meaning "no more data" (§6).
pub const CURSOR_DONE: i64 = -1;

/// Serializes `values` as `v0\0v1\0...vk\0`. Caller is responsible for
/// having sorted `values` beforehand if a stable cursor is required
/// (§4.D).
pub fn serialize(values: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

/// Result of one `*_get` cursor step.
pub struct CursorWrite {
    pub nwritten: u32,
    pub ending_cursor: i64,
}

/// Writes as much of `serialized[cursor..]` as fits in `max_len` bytes at
/// `dest`, without splitting a value in the middle (§4.D).
///
/// Returns `XqdError::BufferLength` if even the next whole value does not
/// fit in `max_len`.
pub fn write_chunk(
    memory: &mut dyn MemoryView,
    serialized: &[u8],
    cursor: i64,
    dest: u32,
    max_len: u32,
) -> Result<CursorWrite, XqdError> {
    if cursor == CURSOR_DONE || cursor as usize >= serialized.len() {
        return Ok(CursorWrite {
            nwritten: 0,
            ending_cursor: CURSOR_DONE,
        });
    }
    let start = cursor as usize;
    let remaining = &serialized[start..];

    // Find the largest prefix of `remaining` that (a) fits in max_len and
    // (b) ends exactly on a NUL terminator, so no value is split.
    let mut take = 0usize;
    let mut last_boundary = 0usize;
    for (i, b) in remaining.iter().enumerate() {
        if i + 1 > max_len as usize {
            break;
        }
        take = i + 1;
        if *b == 0 {
            last_boundary = i + 1;
        }
    }
    if last_boundary == 0 {
        // Not even the first value (up through its NUL) fits.
        let next_nul = remaining
            .iter()
            .position(|&b| b == 0)
            .map(|p| p + 1)
            .unwrap_or(remaining.len());
        return Err(XqdError::BufferLength {
            needed: next_nul as u32,
        });
    }
    let _ = take;
    let chunk = &remaining[..last_boundary];
    memory
        .write_at(dest, chunk)
        .map_err(|_| XqdError::Memory)?;

    let consumed = start + last_boundary;
    let ending_cursor = if consumed >= serialized.len() {
        CURSOR_DONE
    } else {
        consumed as i64
    };

    Ok(CursorWrite {
        nwritten: chunk.len() as u32,
        ending_cursor,
    })
}

/// The guest-visible encoding of a cursor: the byte offset itself, or
/// `u32::MAX` (the bit pattern of `-1i32`) for "done" (§6).
pub fn cursor_as_u32(cursor: i64) -> u32 {
    if cursor == CURSOR_DONE {
        u32::MAX
    } else {
        cursor as u32
    }
}

/// Deserializes a `v0\0v1\0...vk\0` blob back into separate strings.
/// Used by tests to assert round-trips.
pub fn deserialize(blob: &[u8]) -> Vec<String> {
    blob.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn round_trips_across_cursor_steps() {
        let values: Vec<String> = vec!["alpha".into(), "beta".into(), "gamma".into()];
        let blob = serialize(&values);

        let mut mem = FlatMemory::with_size(4096);
        let mut cursor = 0i64;
        let mut reconstructed = Vec::new();
        loop {
            let step = write_chunk(&mut mem, &blob, cursor, 0, 6).unwrap();
            if step.nwritten > 0 {
                let bytes = mem.read_bytes(0, step.nwritten).unwrap();
                reconstructed.extend(deserialize(&bytes));
            }
            cursor = step.ending_cursor;
            if cursor == CURSOR_DONE {
                break;
            }
        }
        assert_eq!(reconstructed, values);
    }

    #[test]
    fn buffer_too_small_for_single_value_errors() {
        let values: Vec<String> = vec!["a-rather-long-value".into()];
        let blob = serialize(&values);
        let mut mem = FlatMemory::with_size(128);
        let err = write_chunk(&mut mem, &blob, 0, 0, 4).unwrap_err();
        assert!(matches!(err, XqdError::BufferLength { .. }));
    }

    #[test]
    fn cursor_done_encodes_as_u32_max() {
        assert_eq!(cursor_as_u32(CURSOR_DONE), u32::MAX);
        assert_eq!(cursor_as_u32(12), 12);
    }

    #[test]
    fn empty_list_is_immediately_done() {
        let blob = serialize(&[]);
        let mut mem = FlatMemory::with_size(16);
        let step = write_chunk(&mut mem, &blob, 0, 0, 16).unwrap();
        assert_eq!(step.nwritten, 0);
        assert_eq!(step.ending_cursor, CURSOR_DONE);
    }
}
