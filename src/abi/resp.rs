//! `xqd_resp_*` family: mirrors `req`'s header/version operations over
//! `ResponseState`, plus `resp_send_downstream` (§4.E, §4.L, §6).

use bytes::Bytes;

use crate::error::XqdError;
use crate::headers;
use crate::instance::Instance;
use crate::memory::MemoryView;
use crate::multivalue;
use crate::version::HttpVersion;

pub fn new(instance: &mut Instance) -> u32 {
    instance.new_response()
}

fn response_mut<'a>(instance: &'a mut Instance, handle: u32) -> Result<&'a mut crate::response::ResponseState, XqdError> {
    instance.responses.get_mut(handle).ok_or(XqdError::InvalidHandle)
}

fn response<'a>(instance: &'a Instance, handle: u32) -> Result<&'a crate::response::ResponseState, XqdError> {
    instance.responses.get(handle).ok_or(XqdError::InvalidHandle)
}

pub fn status_get(instance: &Instance, memory: &mut dyn MemoryView, handle: u32, out: u32) -> Result<(), XqdError> {
    let resp = response(instance, handle)?;
    memory.write_u32(out, resp.status.as_u16() as u32).map_err(|_| XqdError::Memory)
}

pub fn status_set(instance: &mut Instance, handle: u32, code: u32) -> Result<(), XqdError> {
    if code > u16::MAX as u32 {
        return Err(XqdError::InvalidArgument(format!("status {code} out of range")));
    }
    response_mut(instance, handle)?.set_status(code as u16)
}

pub fn version_get(instance: &Instance, memory: &mut dyn MemoryView, handle: u32, out: u32) -> Result<(), XqdError> {
    let resp = response(instance, handle)?;
    memory.write_u32(out, resp.version.as_u32()).map_err(|_| XqdError::Memory)
}

pub fn version_set(instance: &mut Instance, handle: u32, version: u32) -> Result<(), XqdError> {
    let v = HttpVersion::from_settable_u32(version)?;
    response_mut(instance, handle)?.version = v;
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
    let resp = response(instance, handle)?;
    let names = headers::sorted_names(&resp.headers);
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
    let resp = response(instance, handle)?;
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let value = resp
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
    let resp = response(instance, handle)?;
    let raw_name = memory.read_bytes(name_ptr, name_len).map_err(|_| XqdError::Memory)?;
    let name = headers::canonicalize_name(&raw_name)?;
    let values = headers::all_values(&resp.headers, &name);
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
    headers::set_values(&mut response_mut(instance, handle)?.headers, name, &raw_values)
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
    headers::insert(&mut response_mut(instance, handle)?.headers, name, value);
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
    headers::append(&mut response_mut(instance, handle)?.headers, name, value);
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
    headers::remove(&mut response_mut(instance, handle)?.headers, &name)
}

pub fn close(instance: &mut Instance, handle: u32) -> Result<(), XqdError> {
    response(instance, handle)?;
    Ok(())
}

/// `resp_send_downstream`: collects the response's headers/status plus
/// its body handle's current contents into the instance's final
/// downstream response (§4.L).
pub fn send_downstream(instance: &mut Instance, resp_handle: u32, body_handle: u32, streaming: bool) -> Result<(), XqdError> {
    let resp = response(instance, resp_handle)?.clone();
    let _ = streaming; // streaming downstream responses are out of scope for this host (§1 Non-goals: no backpressure-accurate downstream framing is modeled beyond what BodyEntry already provides).

    let body_entry = instance.bodies.get_mut(body_handle).ok_or(XqdError::InvalidHandle)?;
    let body_bytes = Bytes::from(body_entry.read_all()?);

    let mut builder = http::Response::builder().status(resp.status).version(resp.version.to_http());
    for (name, value) in resp.headers.iter() {
        builder = builder.header(name, value);
    }
    let response = builder.body(body_bytes).map_err(|e| XqdError::Internal(e.to_string()))?;
    instance.send_downstream(response);
    Ok(())
}

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
