//! `xqd_geo_lookup`, dictionary, logger and user-agent ABI bindings
//! (§4.H).

use crate::capabilities::{addr_from_octets, GeoRecord};
use crate::error::XqdError;
use crate::instance::Instance;
use crate::memory::MemoryView;

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

/// `xqd_geo_lookup`: serializes the looked-up record to JSON (§4.H).
pub fn geo_lookup(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    addr_ptr: u32,
    addr_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let octets = memory.read_bytes(addr_ptr, addr_len).map_err(|_| XqdError::Memory)?;
    let addr = addr_from_octets(&octets)?;
    let record: GeoRecord = instance.host.geo.lookup(addr);
    let json = serde_json::to_vec(&record).map_err(|e| XqdError::Internal(e.to_string()))?;
    write_sized(memory, &json, buf, buf_len, nwritten_out)
}

/// `xqd_dictionary_open`: dictionaries are looked up by name directly
/// rather than via a handle table, since they are read-only and
/// process-wide (§4.H); the "handle" is the name's presence check.
pub fn dictionary_open(instance: &Instance, memory: &mut dyn MemoryView, name_ptr: u32, name_len: u32, found_out: u32) -> Result<(), XqdError> {
    let name = memory.read_string(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    memory
        .write_u32(found_out, instance.host.dictionaries.contains(&name) as u32)
        .map_err(|_| XqdError::Memory)
}

/// `xqd_dictionary_get`: `InvalidArgument` on a missing dictionary or key,
/// matching the rest of the ABI's treatment of absent lookups.
pub fn dictionary_get(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    dict_name_ptr: u32,
    dict_name_len: u32,
    key_ptr: u32,
    key_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let dict_name = memory.read_string(dict_name_ptr, dict_name_len).map_err(|_| XqdError::Memory)?;
    let key = memory.read_string(key_ptr, key_len).map_err(|_| XqdError::Memory)?;
    let value = instance
        .host
        .dictionaries
        .get(&dict_name, &key)
        .ok_or_else(|| XqdError::InvalidArgument(format!("no such dictionary entry: {dict_name}/{key}")))?;
    write_sized(memory, value.as_bytes(), buf, buf_len, nwritten_out)
}

/// `xqd_log_endpoint_get`: endpoints are named directly, same as
/// dictionaries; presence is reported rather than allocating a handle.
pub fn log_endpoint_get(instance: &Instance, memory: &mut dyn MemoryView, name_ptr: u32, name_len: u32, found_out: u32) -> Result<(), XqdError> {
    let name = memory.read_string(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    memory
        .write_u32(found_out, instance.host.loggers.contains(&name) as u32)
        .map_err(|_| XqdError::Memory)
}

/// `xqd_log_write`: appends a newline-terminated record (§4.H, §8
/// scenario "log").
pub fn log_write(instance: &Instance, memory: &dyn MemoryView, name_ptr: u32, name_len: u32, msg_ptr: u32, msg_len: u32) -> Result<(), XqdError> {
    let name = memory.read_string(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let msg = memory.read_string(msg_ptr, msg_len).map_err(|_| XqdError::Memory)?;
    instance.host.loggers.write(&name, &msg)
}

/// `xqd_user_agent_parse`: `Unsupported` if no parser was configured
/// (§4.H).
pub fn user_agent_parse(
    instance: &Instance,
    memory: &mut dyn MemoryView,
    ua_ptr: u32,
    ua_len: u32,
    buf: u32,
    buf_len: u32,
    nwritten_out: u32,
) -> Result<(), XqdError> {
    let ua = memory.read_string(ua_ptr, ua_len).map_err(|_| XqdError::Memory)?;
    let parser = instance.host.user_agent.as_ref().ok_or(XqdError::Unsupported)?;
    let info = parser.parse(&ua);
    let json = serde_json::to_vec(&info).map_err(|e| XqdError::Internal(e.to_string()))?;
    write_sized(memory, &json, buf, buf_len, nwritten_out)
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
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_instance() -> Instance {
        let mut tables = HashMap::new();
        let mut inner = HashMap::new();
        inner.insert("testkey".to_string(), "Hello from the dictionary".to_string());
        tables.insert("testdict".to_string(), inner);

        let host = Arc::new(Host {
            backends: crate::backend::BackendRegistry::new(Arc::new(DefaultBackend)),
            geo: Arc::new(NullGeoLookup),
            dictionaries: Dictionaries::new(tables),
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
    fn geo_lookup_writes_json_record() {
        let instance = test_instance();
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, &[127, 0, 0, 1]).unwrap();
        geo_lookup(&instance, &mut mem, 0, 4, 100, 100, 200).unwrap();
        let len = mem.read_u32(200).unwrap();
        let json = mem.read_string(100, len).unwrap();
        assert!(json.contains("\"country_code\":null"));
    }

    #[test]
    fn geo_lookup_rejects_bad_addr_len() {
        let instance = test_instance();
        let mut mem = FlatMemory::with_size(64);
        mem.write_at(0, &[1, 2, 3]).unwrap();
        let err = geo_lookup(&instance, &mut mem, 0, 3, 10, 10, 20).unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[test]
    fn dictionary_get_returns_stored_value() {
        let instance = test_instance();
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, b"testdict").unwrap();
        mem.write_at(20, b"testkey").unwrap();
        dictionary_get(&instance, &mut mem, 0, 8, 20, 7, 100, 50, 200).unwrap();
        let len = mem.read_u32(200).unwrap();
        assert_eq!(mem.read_string(100, len).unwrap(), "Hello from the dictionary");
    }

    #[test]
    fn dictionary_get_missing_key_is_invalid_argument() {
        let instance = test_instance();
        let mut mem = FlatMemory::with_size(256);
        mem.write_at(0, b"testdict").unwrap();
        mem.write_at(20, b"nope").unwrap();
        let err = dictionary_get(&instance, &mut mem, 0, 8, 20, 4, 100, 50, 200).unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }
}
