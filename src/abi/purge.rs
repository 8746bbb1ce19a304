//! `xqd_purge_surrogate_key` binding (§4.J).

use crate::error::XqdError;
use crate::memory::MemoryView;
use crate::purge;

/// Reads the surrogate key (validated only for presence; actual cache
/// invalidation is out of scope, §1 Non-goals) and, if `RetBuf` is
/// set, writes the synthesized receipt.
pub fn purge_surrogate_key(
    memory: &mut dyn MemoryView,
    key_ptr: u32,
    key_len: u32,
    mask: u32,
    buf_ptr: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    if key.is_empty() {
        return Err(XqdError::InvalidArgument("surrogate key must not be empty".to_string()));
    }
    purge::write_receipt_if_requested(memory, mask, buf_ptr, buf_len, nwritten_out, purge::current_unix_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn empty_key_is_invalid_argument() {
        let mut mem = FlatMemory::with_size(32);
        let err = purge_surrogate_key(&mut mem, 0, 0, 0, 0, 0, 0).unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[test]
    fn ret_buf_writes_a_receipt() {
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, b"my-key").unwrap();
        purge_surrogate_key(&mut mem, 0, 6, purge::mask_bits::RET_BUF, 50, 100, 200).unwrap();
        let len = mem.read_u32(200).unwrap();
        let body = mem.read_string(50, len).unwrap();
        assert!(body.starts_with(r#"{"id":"purge-"#));
    }
}
