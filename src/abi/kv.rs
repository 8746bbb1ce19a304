//! `xqd_kv_store_*` family: named KV stores, each operation split into a
//! non-blocking "start" call that returns a handle and a `_wait` call
//! that blocks for the result (§4.I).

use std::sync::Arc;

use crate::body::BodyEntry;
use crate::error::XqdError;
use crate::handles::HANDLE_INVALID;
use crate::instance::Instance;
use crate::kv::{self, KvDeleteOutcome, KvInsertOutcome, KvListOutcome, KvLookupOutcome, KvStore};
use crate::memory::MemoryView;
use crate::oneshot::OneShot;

fn store(instance: &Instance, handle: u32) -> Result<Arc<dyn KvStore>, XqdError> {
    instance.kv.stores.get(handle).cloned().ok_or(XqdError::InvalidHandle)
}

/// `kv_store_open`: absence is not an error (§4.I: "write
/// `HandleInvalid` and return `Ok`").
pub fn open(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    name_ptr: u32,
    name_len: u32,
    store_handle_out: u32,
) -> Result<(), XqdError> {
    let name = memory.read_string(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let handle = match instance.host.kv_stores.open(&name) {
        Some(store) => instance.kv.stores.insert(store),
        None => HANDLE_INVALID,
    };
    memory.write_u32(store_handle_out, handle).map_err(|_| XqdError::Memory)
}

/// `kv_store_lookup`: `cfg_mask`/`cfg_ptr` only carry reserved fields
/// today (§4.I), so they are read but otherwise unused.
pub fn lookup(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    _cfg_mask: u32,
    _cfg_ptr: u32,
    lookup_handle_out: u32,
) -> Result<(), XqdError> {
    let s = store(instance, store_handle)?;
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    kv::validate_key(&key)?;

    let out = Arc::new(OneShot::new());
    let handle = instance.kv.lookups.insert(out.clone());
    kv::spawn_lookup(s, key, out);
    memory.write_u32(lookup_handle_out, handle).map_err(|_| XqdError::Memory)
}

/// Installs a lookup's found value as a fresh body handle and writes the
/// metadata/generation/error outputs shared by `lookup_wait` and
/// `lookup_wait_v2` (§4.I).
fn write_lookup_outcome(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    outcome: KvLookupOutcome,
    body_handle_out: u32,
    metadata_buf: u32,
    metadata_max_len: u32,
    metadata_len_out: u32,
) -> Result<u64, XqdError> {
    match outcome.found {
        Some(found) => {
            let mut body = BodyEntry::default();
            body.append(&found.body)?;
            let body_handle = instance.bodies.insert(body);
            memory.write_u32(body_handle_out, body_handle).map_err(|_| XqdError::Memory)?;

            // Truncated, not buffer-length-checked: the actual size is
            // always reported, but a short guest buffer is not an error
            // (§4.I: "write metadata truncated to metadata_max_len").
            let take = found.metadata.len().min(metadata_max_len as usize);
            memory
                .write_at(metadata_buf, &found.metadata[..take])
                .map_err(|_| XqdError::Memory)?;
            memory
                .write_u32(metadata_len_out, found.metadata.len() as u32)
                .map_err(|_| XqdError::Memory)?;
            Ok(found.generation)
        }
        None => {
            memory.write_u32(body_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)?;
            memory.write_u32(metadata_len_out, 0).map_err(|_| XqdError::Memory)?;
            Ok(0)
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn lookup_wait(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    lookup_handle: u32,
    body_handle_out: u32,
    metadata_buf: u32,
    metadata_max_len: u32,
    metadata_len_out: u32,
    generation_out: u32,
    error_out: u32,
) -> Result<(), XqdError> {
    let out = instance.kv.lookups.get(lookup_handle).cloned().ok_or(XqdError::InvalidHandle)?;
    let outcome = out.wait().await;
    let error = outcome.error;
    let generation = write_lookup_outcome(instance, memory, outcome, body_handle_out, metadata_buf, metadata_max_len, metadata_len_out)?;
    memory.write_u32(generation_out, generation as u32).map_err(|_| XqdError::Memory)?;
    memory.write_u32(error_out, error).map_err(|_| XqdError::Memory)
}

#[allow(clippy::too_many_arguments)]
pub async fn lookup_wait_v2(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    lookup_handle: u32,
    body_handle_out: u32,
    metadata_buf: u32,
    metadata_max_len: u32,
    metadata_len_out: u32,
    generation_out: u32,
    error_out: u32,
) -> Result<(), XqdError> {
    let out = instance.kv.lookups.get(lookup_handle).cloned().ok_or(XqdError::InvalidHandle)?;
    let outcome = out.wait().await;
    let error = outcome.error;
    let generation = write_lookup_outcome(instance, memory, outcome, body_handle_out, metadata_buf, metadata_max_len, metadata_len_out)?;
    memory.write_u64(generation_out, generation).map_err(|_| XqdError::Memory)?;
    memory.write_u32(error_out, error).map_err(|_| XqdError::Memory)
}

pub fn insert(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    body_handle: u32,
    cfg_mask: u32,
    cfg_ptr: u32,
    insert_handle_out: u32,
) -> Result<(), XqdError> {
    let s = store(instance, store_handle)?;
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    kv::validate_key(&key)?;
    let body_bytes = instance.bodies.get_mut(body_handle).ok_or(XqdError::InvalidHandle)?.read_all()?;
    let cfg = kv::read_insert_config(&*memory, cfg_ptr, cfg_mask)?;

    let out = Arc::new(OneShot::new());
    let handle = instance.kv.inserts.insert(out.clone());
    kv::spawn_insert(s, key, body_bytes, cfg, out);
    memory.write_u32(insert_handle_out, handle).map_err(|_| XqdError::Memory)
}

pub async fn insert_wait(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    insert_handle: u32,
    generation_out: u32,
    error_out: u32,
) -> Result<(), XqdError> {
    let out: Arc<OneShot<KvInsertOutcome>> =
        instance.kv.inserts.get(insert_handle).cloned().ok_or(XqdError::InvalidHandle)?;
    let outcome = out.wait().await;
    memory.write_u64(generation_out, outcome.generation).map_err(|_| XqdError::Memory)?;
    memory.write_u32(error_out, outcome.error).map_err(|_| XqdError::Memory)
}

pub fn delete(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    store_handle: u32,
    key_ptr: u32,
    key_len: u32,
    delete_handle_out: u32,
) -> Result<(), XqdError> {
    let s = store(instance, store_handle)?;
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    kv::validate_key(&key)?;

    let out = Arc::new(OneShot::new());
    let handle = instance.kv.deletes.insert(out.clone());
    kv::spawn_delete(s, key, out);
    memory.write_u32(delete_handle_out, handle).map_err(|_| XqdError::Memory)
}

pub async fn delete_wait(instance: &mut Instance, memory: &mut dyn MemoryView, delete_handle: u32, error_out: u32) -> Result<(), XqdError> {
    let out: Arc<OneShot<KvDeleteOutcome>> =
        instance.kv.deletes.get(delete_handle).cloned().ok_or(XqdError::InvalidHandle)?;
    let outcome = out.wait().await;
    memory.write_u32(error_out, outcome.error).map_err(|_| XqdError::Memory)
}

pub fn list(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    store_handle: u32,
    cfg_mask: u32,
    cfg_ptr: u32,
    list_handle_out: u32,
) -> Result<(), XqdError> {
    let s = store(instance, store_handle)?;
    let cfg = kv::read_list_config(&*memory, cfg_ptr, cfg_mask)?;

    let out = Arc::new(OneShot::new());
    let handle = instance.kv.lists.insert(out.clone());
    kv::spawn_list(s, cfg, out);
    memory.write_u32(list_handle_out, handle).map_err(|_| XqdError::Memory)
}

/// `list_wait`: the result is emitted as a JSON body (§4.I), so a
/// fresh body handle is installed the same way a lookup hit installs one.
pub async fn list_wait(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    list_handle: u32,
    body_handle_out: u32,
    error_out: u32,
) -> Result<(), XqdError> {
    let out: Arc<OneShot<KvListOutcome>> =
        instance.kv.lists.get(list_handle).cloned().ok_or(XqdError::InvalidHandle)?;
    let outcome = out.wait().await;

    match outcome.result {
        Some(result) => {
            let json = serde_json::to_vec(&result).map_err(|e| XqdError::Internal(e.to_string()))?;
            let mut body = BodyEntry::default();
            body.append(&json)?;
            let body_handle = instance.bodies.insert(body);
            memory.write_u32(body_handle_out, body_handle).map_err(|_| XqdError::Memory)?;
        }
        None => {
            memory.write_u32(body_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)?;
        }
    }
    memory.write_u32(error_out, outcome.error).map_err(|_| XqdError::Memory)
}
