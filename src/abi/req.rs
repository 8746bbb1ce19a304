//! `xqd_req_*` family (§4.E, §6). Every function here is
//! engine-agnostic: it operates on `Instance` handle tables and a
//! `MemoryView`, independent of wasmtime.

use crate::backend::{read_dynamic_backend_config, DynamicBackendConfig};
use crate::error::XqdError;
use crate::framing::FramingHeadersMode;
use crate::handles::HANDLE_INVALID;
use crate::headers;
use crate::instance::{Instance, DOWNSTREAM_HANDLE};
use crate::memory::MemoryView;
use crate::multivalue;
use crate::version::HttpVersion;

pub fn new(instance: &mut Instance) -> u32 {
    instance.new_request()
}

fn request_mut<'a>(instance: &'a mut Instance, handle: u32) -> Result<&'a mut crate::request::RequestState, XqdError> {
    instance.requests.get_mut(handle).ok_or(XqdError::InvalidHandle)
}

fn request<'a>(instance: &'a Instance, handle: u32) -> Result<&'a crate::request::RequestState, XqdError> {
    instance.requests.get(handle).ok_or(XqdError::InvalidHandle)
}

pub fn method_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    let bytes = req.method.as_str().as_bytes();
    write_sized(memory, bytes, buf, buf_len, nwritten_out)
}

pub fn method_set(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    ptr: u32,
    len: u32,
) -> Result<(), XqdError> {
    let raw = memory.read_bytes(ptr, len).map_err(|_| XqdError::Memory)?;
    request_mut(instance, handle)?.set_method(&raw)
}

pub fn uri_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    let text = req.url_string();
    write_sized(memory, text.as_bytes(), buf, buf_len, nwritten_out)
}

pub fn uri_set(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    ptr: u32,
    len: u32,
) -> Result<(), XqdError> {
    let raw = memory.read_bytes(ptr, len).map_err(|_| XqdError::Memory)?;
    request_mut(instance, handle)?.set_url(&raw)
}

pub fn version_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    version_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    memory
        .write_u32(version_out, req.version.as_u32())
        .map_err(|_| XqdError::Memory)
}

pub fn version_set(instance: &mut Instance, handle: u32, version: u32) -> Result<(), XqdError> {
    let v = HttpVersion::from_settable_u32(version)?;
    request_mut(instance, handle)?.version = v;
    Ok(())
}

pub fn header_names_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    cursor: i64,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
    ending_cursor_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    let names = headers::sorted_names(&req.headers);
    let blob = multivalue::serialize(&names);
    let step = multivalue::write_chunk(memory, &blob, cursor, buf, buf_len)?;
    memory.write_u32(nwritten_out, step.nwritten).map_err(|_| XqdError::Memory)?;
    memory
        .write_u32(ending_cursor_out, multivalue::cursor_as_u32(step.ending_cursor))
        .map_err(|_| XqdError::Memory)
}

pub fn header_value_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let value = req
        .headers
        .get(&name)
        .ok_or_else(|| XqdError::InvalidArgument(format!("no such header: {name}")))?;
    write_sized(memory, value.as_bytes(), buf, buf_len, nwritten_out)
}

pub fn header_values_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    cursor: i64,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
    ending_cursor_out: u32,
) -> Result<(), XqdError> {
    let req = request(instance, handle)?;
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let values = headers::all_values(&req.headers, &name);
    let blob = multivalue::serialize(&values);
    let step = multivalue::write_chunk(memory, &blob, cursor, buf, buf_len)?;
    memory.write_u32(nwritten_out, step.nwritten).map_err(|_| XqdError::Memory)?;
    memory
        .write_u32(ending_cursor_out, multivalue::cursor_as_u32(step.ending_cursor))
        .map_err(|_| XqdError::Memory)
}

pub fn header_values_set(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    values_ptr: u32,
    values_len: u32,
) -> Result<(), XqdError> {
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let raw_values = memory.read_bytes(values_ptr, values_len).map_err(|_| XqdError::Memory)?;
    headers::set_values(&mut request_mut(instance, handle)?.headers, name, &raw_values)
}

pub fn header_insert(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
) -> Result<(), XqdError> {
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let raw_value = memory.read_bytes(value_ptr, value_len).map_err(|_| XqdError::Memory)?;
    let value = headers::parse_value(&raw_value)?;
    headers::insert(&mut request_mut(instance, handle)?.headers, name, value);
    Ok(())
}

pub fn header_append(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
) -> Result<(), XqdError> {
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let raw_value = memory.read_bytes(value_ptr, value_len).map_err(|_| XqdError::Memory)?;
    let value = headers::parse_value(&raw_value)?;
    headers::append(&mut request_mut(instance, handle)?.headers, name, value);
    Ok(())
}

pub fn header_remove(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    name_ptr: u32,
    name_len: u32,
) -> Result<(), XqdError> {
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    headers::remove(&mut request_mut(instance, handle)?.headers, &name)
}

/// `req_cache_override_set` / `_v2_set`: accept and ignore, validating
/// only that the handle exists (§4.E).
pub fn cache_override_set(instance: &mut Instance, handle: u32, tag: u32, ttl: u32, swr: u32) -> Result<(), XqdError> {
    let req = request_mut(instance, handle)?;
    req.cache_override = Some(crate::request::CacheOverride {
        tag,
        ttl,
        stale_while_revalidate: swr,
        surrogate_key: None,
    });
    Ok(())
}

/// `req_cache_override_v2_set`: as `cache_override_set`, plus an optional
/// surrogate key (§6 "_v2_set").
#[allow(clippy::too_many_arguments)]
pub fn cache_override_v2_set(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    handle: u32,
    tag: u32,
    ttl: u32,
    swr: u32,
    sk_ptr: u32,
    sk_len: u32,
) -> Result<(), XqdError> {
    let surrogate_key = if sk_len == 0 {
        None
    } else {
        Some(memory.read_string(sk_ptr, sk_len).map_err(|_| XqdError::Memory)?)
    };
    let req = request_mut(instance, handle)?;
    req.cache_override = Some(crate::request::CacheOverride {
        tag,
        ttl,
        stale_while_revalidate: swr,
        surrogate_key,
    });
    Ok(())
}

/// `req_body_downstream_get`: always the reserved pair (§4.E).
pub fn body_downstream_get(
    memory: &mut dyn MemoryView,
    req_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    memory.write_u32(req_handle_out, DOWNSTREAM_HANDLE).map_err(|_| XqdError::Memory)?;
    memory.write_u32(body_handle_out, DOWNSTREAM_HANDLE).map_err(|_| XqdError::Memory)
}

pub fn framing_headers_mode_set(instance: &mut Instance, handle: u32, mode: u32) -> Result<(), XqdError> {
    let parsed = FramingHeadersMode::from_u32(mode)
        .ok_or_else(|| XqdError::InvalidArgument(format!("unknown framing mode {mode}")))?;
    request_mut(instance, handle)?.framing = parsed;
    Ok(())
}

pub fn auto_decompress_response_set(instance: &mut Instance, handle: u32, mask: u32) -> Result<(), XqdError> {
    request_mut(instance, handle)?.auto_decompress = mask;
    Ok(())
}

/// `req_close`: sets a flag only; no resources are actually released
/// until the instance ends (§5 "Resource release").
pub fn close(instance: &mut Instance, handle: u32) -> Result<(), XqdError> {
    request_mut(instance, handle)?.close_on_completion = true;
    Ok(())
}

/// `req_register_dynamic_backend`: the target URL is a separate
/// `(ptr, len)` pair, not part of the 96-byte config struct (§4.F,
/// §6: "target itself is passed as the guest's separate (addr, len)
/// pair").
pub fn register_dynamic_backend(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    name_ptr: u32,
    name_len: u32,
    target_ptr: u32,
    target_len: u32,
    cfg_ptr: u32,
    mask: u32,
) -> Result<(), XqdError> {
    let name = memory.read_string(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let target = memory.read_string(target_ptr, target_len).map_err(|_| XqdError::Memory)?;
    let mut cfg: DynamicBackendConfig = read_dynamic_backend_config(memory, cfg_ptr, mask)?;
    cfg.target = Some(target);
    instance.host.backends.register_dynamic(name, cfg)
}

pub fn downstream_client_ddos_detected(memory: &mut dyn MemoryView, out: u32) -> Result<(), XqdError> {
    memory.write_u32(out, 0).map_err(|_| XqdError::Memory)
}

pub fn fastly_key_is_valid(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    key_ptr: u32,
    key_len: u32,
    out: u32,
) -> Result<(), XqdError> {
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    let valid = instance.host.fastly_key_is_valid(&key);
    memory.write_u32(out, valid as u32).map_err(|_| XqdError::Memory)
}

pub fn downstream_compliance_region(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    write_sized(memory, instance.host.compliance_region.as_bytes(), buf, buf_len, nwritten_out)
}

/// Writes `bytes` to `buf` if it fits in `buf_len`, always reporting the
/// true size to `nwritten_out` (§7 "BufferLength... always also
/// write required size").
fn write_sized(memory: &mut dyn MemoryView, bytes: &[u8], buf: u32, buf_len: u32, nwritten_out: u32) -> Result<(), XqdError> {
    if bytes.len() > buf_len as usize {
        memory
            .write_u32(nwritten_out, bytes.len() as u32)
            .map_err(|_| XqdError::Memory)?;
        return Err(XqdError::BufferLength {
            needed: bytes.len() as u32,
        });
    }
    memory.write_at(buf, bytes).map_err(|_| XqdError::Memory)?;
    memory.write_u32(nwritten_out, bytes.len() as u32).map_err(|_| XqdError::Memory)
}

/// Validates a handle exists without reading through it (§4.G
/// "validate request/body handles" step 1).
pub fn validate_handle(instance: &Instance, handle: u32) -> Result<(), XqdError> {
    if handle == HANDLE_INVALID || instance.requests.get(handle).is_none() {
        return Err(XqdError::InvalidHandle);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;
    use crate::capabilities::{Dictionaries, LogEndpoints, NullGeoLookup};
    use crate::instance::Host;
    use crate::kv::KvStoreRegistry;
    use crate::memory::FlatMemory;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_instance() -> Instance {
        let host = Arc::new(Host {
            backends: crate::backend::BackendRegistry::new(Arc::new(DefaultBackend)),
            geo: Arc::new(NullGeoLookup),
            dictionaries: Dictionaries::default(),
            loggers: LogEndpoints::default(),
            user_agent: None,
            kv_stores: KvStoreRegistry::new(),
            compliance_region: "none".to_string(),
            fastly_keys: Default::default(),
        });
        let downstream = http::Request::builder().method("GET").uri("/x").body(Bytes::new()).unwrap();
        Instance::new(host, downstream, CancellationToken::new())
    }

    #[test]
    fn method_set_then_get_roundtrips() {
        let mut instance = test_instance();
        let handle = new(&mut instance);
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, b"post").unwrap();
        method_set(&mut instance, &mem, handle, 0, 4).unwrap();
        method_get(&instance, &mut mem, handle, 100, 50, 200).unwrap();
        assert_eq!(mem.read_string(100, mem.read_u32(200).unwrap()).unwrap(), "POST");
    }

    #[test]
    fn header_insert_is_visible_via_value_get() {
        let mut instance = test_instance();
        let handle = new(&mut instance);
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, b"x-test").unwrap();
        mem.write_at(10, b"hello").unwrap();
        header_insert(&mut instance, &mem, handle, 0, 6, 10, 5).unwrap();
        header_value_get(&instance, &mut mem, handle, 0, 6, 100, 50, 200).unwrap();
        assert_eq!(mem.read_string(100, mem.read_u32(200).unwrap()).unwrap(), "hello");
    }

    #[test]
    fn invalid_handle_is_rejected() {
        let instance = test_instance();
        let mut mem = FlatMemory::with_size(16);
        let err = method_get(&instance, &mut mem, 999, 0, 16, 8).unwrap_err();
        assert!(matches!(err, XqdError::InvalidHandle));
    }

    #[test]
    fn downstream_get_returns_reserved_pair() {
        let mut mem = FlatMemory::with_size(16);
        body_downstream_get(&mut mem, 0, 4).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), DOWNSTREAM_HANDLE);
        assert_eq!(mem.read_u32(4).unwrap(), DOWNSTREAM_HANDLE);
    }

    #[test]
    fn cache_override_v2_set_stores_surrogate_key() {
        let mut instance = test_instance();
        let handle = new(&mut instance);
        let mut mem = FlatMemory::with_size(32);
        mem.write_at(0, b"mykey").unwrap();
        cache_override_v2_set(&mut instance, &mem, handle, 1, 60, 0, 0, 5).unwrap();
        let stored = instance.requests.get(handle).unwrap().cache_override.as_ref().unwrap();
        assert_eq!(stored.surrogate_key.as_deref(), Some("mykey"));
    }
}
