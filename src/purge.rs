//! Component J: surrogate-key purge, returning a synthesized JSON receipt
//! (§4.J, §6 "Purge JSON"). Real cache invalidation is out of scope
//! (§1 Non-goals); this always "succeeds".

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::XqdError;
use crate::memory::MemoryView;

pub mod mask_bits {
    pub const SOFT_PURGE: u32 = 1 << 0;
    pub const RET_BUF: u32 = 1 << 1;
}

#[derive(Serialize)]
struct PurgeReceipt {
    id: String,
    status: &'static str,
}

/// Builds the `{"id":"purge-<unix_nanos>","status":"ok"}` receipt
/// (§6). `now_nanos` is injected so tests are deterministic.
pub fn build_receipt(now_nanos: u128) -> String {
    let receipt = PurgeReceipt {
        id: format!("purge-{now_nanos}"),
        status: "ok",
    };
    serde_json::to_string(&receipt).expect("serializable")
}

pub fn current_unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// `purge_surrogate_key`: the key and mask are validated by the caller;
/// this function only handles the `RetBuf` write-out, using the same
/// buffer-length discipline as the rest of the ABI (§4.J).
pub fn write_receipt_if_requested(
    memory: &mut dyn MemoryView,
    mask: u32,
    buf_ptr: u32,
    buf_len: u32,
    nwritten_out: u32,
    now_nanos: u128,
) -> Result<(), XqdError> {
    if mask & mask_bits::RET_BUF == 0 {
        return Ok(());
    }
    let receipt = build_receipt(now_nanos);
    let bytes = receipt.as_bytes();
    if bytes.len() > buf_len as usize {
        memory
            .write_u32(nwritten_out, bytes.len() as u32)
            .map_err(|_| XqdError::Memory)?;
        return Err(XqdError::BufferLength {
            needed: bytes.len() as u32,
        });
    }
    memory.write_at(buf_ptr, bytes).map_err(|_| XqdError::Memory)?;
    memory
        .write_u32(nwritten_out, bytes.len() as u32)
        .map_err(|_| XqdError::Memory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn receipt_has_expected_shape() {
        let receipt = build_receipt(12345);
        assert_eq!(receipt, r#"{"id":"purge-12345","status":"ok"}"#);
    }

    #[test]
    fn ret_buf_writes_receipt() {
        let mut mem = FlatMemory::with_size(256);
        write_receipt_if_requested(&mut mem, mask_bits::RET_BUF, 0, 200, 200, 1).unwrap();
        let len = mem.read_u32(200).unwrap();
        let bytes = mem.read_bytes(0, len).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"id":"purge-1","status":"ok"}"#);
    }

    #[test]
    fn small_buffer_reports_required_size() {
        let mut mem = FlatMemory::with_size(256);
        let err = write_receipt_if_requested(&mut mem, mask_bits::RET_BUF, 0, 2, 200, 1).unwrap_err();
        assert!(matches!(err, XqdError::BufferLength { .. }));
    }
}
