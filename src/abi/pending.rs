//! `xqd_req_send*` / `xqd_pending_req_*` family: the guest-visible face of
//! the subrequest engine in `subrequest.rs` (§4.G, §6).

use std::sync::Arc;

use bytes::Bytes;

use crate::body::BodyEntry;
use crate::error::XqdError;
use crate::handles::HANDLE_INVALID;
use crate::instance::Instance;
use crate::memory::MemoryView;
use crate::response::ResponseState;
use crate::subrequest::{self, PendingRequest, SendErrorDetail, SendErrorTag, SendOutcome};
use crate::version::HttpVersion;

/// Reads the request and body state a send needs, and drains the body's
/// bytes, all before any `.await` so no table borrow outlives the
/// synchronous portion of the call (§4.G step 1-2).
fn prepare_send(
    instance: &mut Instance,
    memory: &dyn MemoryView,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
) -> Result<(crate::request::RequestState, Bytes, String), XqdError> {
    let req = instance
        .requests
        .get(req_handle)
        .ok_or(XqdError::InvalidHandle)?
        .clone();
    if req.url.is_none() {
        return Err(XqdError::HttpUserInvalid("request has no url".to_string()));
    }
    let body_bytes = instance
        .bodies
        .get_mut(body_handle)
        .ok_or(XqdError::InvalidHandle)?
        .read_all()
        .map(Bytes::from)?;
    let backend_name = memory
        .read_string(backend_ptr, backend_len)
        .map_err(|_| XqdError::Memory)?;
    Ok((req, body_bytes, backend_name))
}

/// Installs a successful send's response into fresh response/body handles
/// and writes them to the guest's out-pointers (§4.G step 9).
fn install_response(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    resp: http::Response<Bytes>,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let (parts, body) = resp.into_parts();
    let response = ResponseState {
        status: parts.status,
        version: HttpVersion::from_http(parts.version),
        headers: parts.headers,
        body: None,
        framing: Default::default(),
        auto_decompress: 0,
    };
    let resp_handle = instance.responses.insert(response);
    let mut body_entry = BodyEntry::default();
    body_entry.append(&body)?;
    let body_handle = instance.bodies.insert(body_entry);

    memory.write_u32(resp_handle_out, resp_handle).map_err(|_| XqdError::Memory)?;
    memory.write_u32(body_handle_out, body_handle).map_err(|_| XqdError::Memory)
}

/// Maps a classified transport failure onto the single `XqdError` the
/// non-`_v2` send variants surface (§4.G).
fn tag_to_error(tag: SendErrorTag) -> XqdError {
    XqdError::Internal(format!("subrequest send failed: {tag:?}"))
}

/// Synchronous `req_send` (§4.G steps 1-9).
pub async fn send(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let (req, body, backend_name) = prepare_send(instance, memory, req_handle, body_handle, backend_ptr, backend_len)?;
    let host = instance.host.clone();
    let cancelled = instance.cancelled.clone();

    instance.pause_cpu();
    let outcome = subrequest::send_synchronous(&host, &backend_name, &req, body, req.auto_decompress, &cancelled).await;
    instance.resume_cpu();

    match outcome {
        Ok(resp) => install_response(instance, memory, resp, resp_handle_out, body_handle_out),
        Err(tag) => Err(tag_to_error(tag)),
    }
}

pub async fn send_async(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    pending_handle_out: u32,
) -> Result<(), XqdError> {
    let (req, body, backend_name) = prepare_send(instance, &*memory, req_handle, body_handle, backend_ptr, backend_len)?;
    let auto_decompress = req.auto_decompress;
    let pending = subrequest::send_asynchronous(instance.host.clone(), backend_name, req, body, auto_decompress);
    let handle = instance.pending.insert(pending);
    memory.write_u32(pending_handle_out, handle).map_err(|_| XqdError::Memory)
}

/// `req_send_async_streaming`: converts `body_handle` to streaming mode
/// first so the guest can keep writing to it while the send is in flight
/// (§4.G "converts the supplied body handle to streaming mode").
/// The chunks are collected into one buffer before being handed to the
/// shared send path, since the backend client in this host speaks
/// `Bytes` bodies rather than a live channel (§1 Non-goals: no
/// backpressure-accurate upstream framing beyond `BodyEntry` itself).
pub async fn send_async_streaming(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    pending_handle_out: u32,
) -> Result<(), XqdError> {
    let req = instance.requests.get(req_handle).ok_or(XqdError::InvalidHandle)?.clone();
    if req.url.is_none() {
        return Err(XqdError::HttpUserInvalid("request has no url".to_string()));
    }
    let backend_name = memory.read_string(backend_ptr, backend_len).map_err(|_| XqdError::Memory)?;
    let mut rx = instance
        .bodies
        .get_mut(body_handle)
        .ok_or(XqdError::InvalidHandle)?
        .activate_streaming();

    let host = instance.host.clone();
    let auto_decompress = req.auto_decompress;
    let pending = Arc::new(PendingRequest::default());
    let pending_clone = pending.clone();
    tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        match subrequest::run_send(&host, &backend_name, &req, Bytes::from(collected), auto_decompress).await {
            Ok(resp) => pending_clone.complete(SendOutcome::Response(Arc::new(resp))),
            Err(tag) => pending_clone.complete(SendOutcome::Failed(tag)),
        }
    });

    let handle = instance.pending.insert(pending);
    memory.write_u32(pending_handle_out, handle).map_err(|_| XqdError::Memory)
}

/// `req_send_async_v2`: same as `send_async`, dispatching on `streaming`
/// rather than being a separately-named entry point (§4.G "`_v2`
/// dispatches by a streaming flag parameter").
#[allow(clippy::too_many_arguments)]
pub async fn send_async_v2(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    req_handle: u32,
    body_handle: u32,
    backend_ptr: u32,
    backend_len: u32,
    streaming: bool,
    pending_handle_out: u32,
) -> Result<(), XqdError> {
    if streaming {
        send_async_streaming(instance, memory, req_handle, body_handle, backend_ptr, backend_len, pending_handle_out).await
    } else {
        send_async(instance, memory, req_handle, body_handle, backend_ptr, backend_len, pending_handle_out).await
    }
}

fn pending_request(instance: &Instance, handle: u32) -> Result<Arc<PendingRequest>, XqdError> {
    instance.pending.get(handle).cloned().ok_or(XqdError::InvalidHandle)
}

/// Writes the not-ready shape: `is_done=0`, both out-handles invalid
/// (§4.G "write is_done=0 and HandleInvalid for both out-handles").
fn write_not_ready(memory: &mut dyn MemoryView, is_done_out: u32, resp_handle_out: u32, body_handle_out: u32) -> Result<(), XqdError> {
    memory.write_u32(is_done_out, 0).map_err(|_| XqdError::Memory)?;
    memory.write_u32(resp_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)?;
    memory.write_u32(body_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)
}

/// Consumes a ready outcome, writing `is_done=1` plus fresh handles on
/// success or invalid handles on failure (§4.G "on success write
/// is_done=1 and new response/body handles; on error... both invalid").
fn write_ready(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    outcome: SendOutcome,
    is_done_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    memory.write_u32(is_done_out, 1).map_err(|_| XqdError::Memory)?;
    match outcome {
        SendOutcome::Response(resp) => {
            let resp = Arc::try_unwrap(resp).unwrap_or_else(|arc| (*arc).clone());
            install_response(instance, memory, resp, resp_handle_out, body_handle_out)
        }
        SendOutcome::Failed(tag) => {
            memory.write_u32(resp_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)?;
            memory.write_u32(body_handle_out, HANDLE_INVALID).map_err(|_| XqdError::Memory)?;
            Err(tag_to_error(tag))
        }
    }
}

/// `pending_req_poll` (§4.G: non-blocking).
pub fn poll(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    pending_handle: u32,
    is_done_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let pending = pending_request(instance, pending_handle)?;
    match pending.try_get() {
        None => write_not_ready(memory, is_done_out, resp_handle_out, body_handle_out),
        Some(outcome) => write_ready(instance, memory, outcome, is_done_out, resp_handle_out, body_handle_out),
    }
}

/// `pending_req_poll_v2`: as `poll`, plus an error-detail struct written
/// unconditionally (§7's note on canonical parameter order: this
/// host uses `error_detail_out, is_done_out, wh_out, bh_out`).
pub fn poll_v2(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    pending_handle: u32,
    error_detail_out: u32,
    is_done_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let pending = pending_request(instance, pending_handle)?;
    match pending.try_get() {
        None => {
            SendErrorDetail::ok().write_to(memory, error_detail_out)?;
            write_not_ready(memory, is_done_out, resp_handle_out, body_handle_out)
        }
        Some(outcome) => {
            let detail = match &outcome {
                SendOutcome::Response(_) => SendErrorDetail::ok(),
                SendOutcome::Failed(tag) => SendErrorDetail::from_tag(*tag),
            };
            detail.write_to(memory, error_detail_out)?;
            write_ready(instance, memory, outcome, is_done_out, resp_handle_out, body_handle_out)
        }
    }
}

/// `pending_req_wait`: blocks (with CPU accounting paused) until ready
/// (§4.G).
pub async fn wait(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    pending_handle: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let pending = pending_request(instance, pending_handle)?;
    instance.pause_cpu();
    let outcome = pending.wait().await;
    instance.resume_cpu();

    match outcome {
        SendOutcome::Response(resp) => {
            let resp = Arc::try_unwrap(resp).unwrap_or_else(|arc| (*arc).clone());
            install_response(instance, memory, resp, resp_handle_out, body_handle_out)
        }
        SendOutcome::Failed(tag) => Err(tag_to_error(tag)),
    }
}

pub async fn wait_v2(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    pending_handle: u32,
    error_detail_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    let pending = pending_request(instance, pending_handle)?;
    instance.pause_cpu();
    let outcome = pending.wait().await;
    instance.resume_cpu();

    let detail = match &outcome {
        SendOutcome::Response(_) => SendErrorDetail::ok(),
        SendOutcome::Failed(tag) => SendErrorDetail::from_tag(*tag),
    };
    detail.write_to(memory, error_detail_out)?;

    match outcome {
        SendOutcome::Response(resp) => {
            let resp = Arc::try_unwrap(resp).unwrap_or_else(|arc| (*arc).clone());
            install_response(instance, memory, resp, resp_handle_out, body_handle_out)
        }
        SendOutcome::Failed(tag) => Err(tag_to_error(tag)),
    }
}

/// `pending_req_select`: validates every handle, then waits for the first
/// to complete (§4.G, §5).
pub async fn select(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    handles_ptr: u32,
    handles_count: u32,
    winner_index_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    if handles_count == 0 {
        return Err(XqdError::InvalidArgument(
            "pending_req_select requires at least one handle".to_string(),
        ));
    }
    let mut pendings = Vec::with_capacity(handles_count as usize);
    for i in 0..handles_count {
        let raw = memory.read_u32(handles_ptr + i * 4).map_err(|_| XqdError::Memory)?;
        pendings.push(pending_request(instance, raw)?);
    }

    instance.pause_cpu();
    let winner = subrequest::select_first(&pendings).await?;
    instance.resume_cpu();

    memory.write_u32(winner_index_out, winner as u32).map_err(|_| XqdError::Memory)?;
    let outcome = pendings[winner].try_get().expect("select_first only returns a ready index");
    match outcome {
        SendOutcome::Response(resp) => {
            let resp = Arc::try_unwrap(resp).unwrap_or_else(|arc| (*arc).clone());
            install_response(instance, memory, resp, resp_handle_out, body_handle_out)
        }
        SendOutcome::Failed(tag) => Err(tag_to_error(tag)),
    }
}

pub async fn select_v2(
    instance: &mut Instance,
    memory: &mut dyn MemoryView,
    handles_ptr: u32,
    handles_count: u32,
    winner_index_out: u32,
    error_detail_out: u32,
    resp_handle_out: u32,
    body_handle_out: u32,
) -> Result<(), XqdError> {
    if handles_count == 0 {
        return Err(XqdError::InvalidArgument(
            "pending_req_select requires at least one handle".to_string(),
        ));
    }
    let mut pendings = Vec::with_capacity(handles_count as usize);
    for i in 0..handles_count {
        let raw = memory.read_u32(handles_ptr + i * 4).map_err(|_| XqdError::Memory)?;
        pendings.push(pending_request(instance, raw)?);
    }

    instance.pause_cpu();
    let winner = subrequest::select_first(&pendings).await?;
    instance.resume_cpu();

    memory.write_u32(winner_index_out, winner as u32).map_err(|_| XqdError::Memory)?;
    let outcome = pendings[winner].try_get().expect("select_first only returns a ready index");
    let detail = match &outcome {
        SendOutcome::Response(_) => SendErrorDetail::ok(),
        SendOutcome::Failed(tag) => SendErrorDetail::from_tag(*tag),
    };
    detail.write_to(memory, error_detail_out)?;

    match outcome {
        SendOutcome::Response(resp) => {
            let resp = Arc::try_unwrap(resp).unwrap_or_else(|arc| (*arc).clone());
            install_response(instance, memory, resp, resp_handle_out, body_handle_out)
        }
        SendOutcome::Failed(tag) => Err(tag_to_error(tag)),
    }
}
