//! Component A: typed little-endian reads/writes over the guest's linear
//! memory. Engine-agnostic by design (§4.A, §9) so the logic in
//! `instance.rs` can be exercised in tests against a plain `Vec<u8>`
//! instead of a live wasmtime `Caller`.

use crate::error::{XqdError, XqdResult};

/// A view over a guest's linear memory, addressed by absolute byte offset.
///
/// The wasmtime-specific adapter in `abi::linking` implements this over
/// the `memory` export fetched from a `Caller`; `tests::fakes::FlatMemory`
/// implements it over an owned `Vec<u8>` for unit tests.
pub trait MemoryView: Send {
    fn len(&self) -> usize;

    fn read_at(&self, off: u32, dst: &mut [u8]) -> XqdResult<()>;
    fn write_at(&mut self, off: u32, src: &[u8]) -> XqdResult<()>;

    fn read_bytes(&self, off: u32, len: u32) -> XqdResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_at(off, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, off: u32) -> XqdResult<u8> {
        let mut buf = [0u8; 1];
        self.read_at(off, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, off: u32) -> XqdResult<u16> {
        let mut buf = [0u8; 2];
        self.read_at(off, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, off: u32) -> XqdResult<u32> {
        let mut buf = [0u8; 4];
        self.read_at(off, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, off: u32) -> XqdResult<u64> {
        let mut buf = [0u8; 8];
        self.read_at(off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, off: u32, v: u8) -> XqdResult<()> {
        self.write_at(off, &[v])
    }

    fn write_u16(&mut self, off: u32, v: u16) -> XqdResult<()> {
        self.write_at(off, &v.to_le_bytes())
    }

    fn write_u32(&mut self, off: u32, v: u32) -> XqdResult<()> {
        self.write_at(off, &v.to_le_bytes())
    }

    fn write_i32(&mut self, off: u32, v: i32) -> XqdResult<()> {
        self.write_at(off, &v.to_le_bytes())
    }

    fn write_u64(&mut self, off: u32, v: u64) -> XqdResult<()> {
        self.write_at(off, &v.to_le_bytes())
    }

    /// Reads a string of `len` bytes at `off` and validates it as UTF-8.
    fn read_string(&self, off: u32, len: u32) -> XqdResult<String> {
        let bytes = self.read_bytes(off, len)?;
        String::from_utf8(bytes).map_err(|_| XqdError::InvalidArgument("not valid utf-8".into()))
    }
}

/// An owned, growable stand-in for linear memory, used by unit tests and
/// by the driver when seeding downstream request bytes ahead of guest
/// instantiation.
#[derive(Default)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn with_size(size: usize) -> Self {
        FlatMemory {
            bytes: vec![0u8; size],
        }
    }
}

/// Borrows a wasmtime `Memory`'s backing bytes directly (via
/// `Memory::data_and_store_mut`), so the wasmtime adapter in
/// `abi::linking` needs no logic of its own beyond fetching the export.
pub struct SliceMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SliceMemory<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        SliceMemory { bytes }
    }
}

impl MemoryView for SliceMemory<'_> {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read_at(&self, off: u32, dst: &mut [u8]) -> XqdResult<()> {
        let start = off as usize;
        let end = start.checked_add(dst.len()).ok_or(XqdError::Memory)?;
        let src = self.bytes.get(start..end).ok_or(XqdError::Memory)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, off: u32, src: &[u8]) -> XqdResult<()> {
        let start = off as usize;
        let end = start.checked_add(src.len()).ok_or(XqdError::Memory)?;
        let dst = self.bytes.get_mut(start..end).ok_or(XqdError::Memory)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl MemoryView for FlatMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read_at(&self, off: u32, dst: &mut [u8]) -> XqdResult<()> {
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(XqdError::Memory)?;
        let src = self.bytes.get(start..end).ok_or(XqdError::Memory)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, off: u32, src: &[u8]) -> XqdResult<()> {
        let start = off as usize;
        let end = start.checked_add(src.len()).ok_or(XqdError::Memory)?;
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(src);
        Ok(())
    }
}
