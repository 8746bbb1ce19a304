//! The one engine-specific file in the ABI dispatch layer: builds a
//! `Linker<StoreData>` that binds every name in the `env` module catalog
//! to the engine-agnostic functions in the sibling `abi::*` modules, plus
//! WASI preview1 for guest stdio (§4.K).
//!
//! Every binding follows the same shape: fetch the `memory` export and
//! the per-instance `Instance` out of the `Caller`'s store data, call the
//! matching `abi::*` function, and translate its `Result<(), XqdError>`
//! into the guest-visible i32 status code. Bindings that don't touch
//! memory (header-free Instance-only calls) skip the memory fetch.

use std::future::Future;
use std::pin::Pin;

use wasmtime::{Caller, Engine, Extern, Linker};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::abi::{body, capabilities, kv, pending, purge, req, resp, stubs};
use crate::error::XqdError;
use crate::instance::Instance;
use crate::memory::{MemoryView, SliceMemory};

/// Per-`Store` data: the request-scoped `Instance` plus the WASI preview1
/// context backing the guest's stdio.
pub struct StoreData {
    pub instance: Instance,
    wasi: WasiP1Ctx,
}

impl StoreData {
    /// WASI stdio inheritance is enabled so the guest's `println!`
    /// reaches the host terminal (§4.K).
    pub fn new(instance: Instance) -> Self {
        let wasi = WasiCtxBuilder::new().inherit_stdout().inherit_stderr().build_p1();
        StoreData { instance, wasi }
    }
}

fn memory_and_instance<'a>(caller: &'a mut Caller<'_, StoreData>) -> Result<(SliceMemory<'a>, &'a mut Instance), XqdError> {
    let memory = caller.get_export("memory").and_then(Extern::into_memory).ok_or(XqdError::Memory)?;
    let (data, store_data) = memory.data_and_store_mut(caller);
    Ok((SliceMemory::new(data), &mut store_data.instance))
}

fn instance_only(caller: &mut Caller<'_, StoreData>) -> &mut Instance {
    &mut caller.data_mut().instance
}

fn status_of(result: Result<(), XqdError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!(error = %e, "abi call returned an error status");
            e.status().code()
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Builds the linker used by `driver.rs` for every guest instantiation.
/// The module is precompiled once; this linker (and the `Engine` it
/// borrows from) is shared across instances, since it holds no
/// per-request state itself (§4.L "the module is precompiled and
/// shared").
pub fn build_linker(engine: &Engine) -> anyhow::Result<Linker<StoreData>> {
    let mut linker: Linker<StoreData> = Linker::new(engine);
    preview1::add_to_linker_async(&mut linker, |data: &mut StoreData| &mut data.wasi)?;

    linker.func_wrap("env", "xqd_init", |_caller: Caller<'_, StoreData>, abi_version: i64| -> i32 {
        tracing::debug!(abi_version, "guest initialized");
        0
    })?;

    bind_req(&mut linker)?;
    bind_resp(&mut linker)?;
    bind_body(&mut linker)?;
    bind_pending(&mut linker)?;
    bind_kv(&mut linker)?;
    bind_capabilities(&mut linker)?;
    bind_purge(&mut linker)?;
    bind_stubs(&mut linker)?;

    Ok(linker)
}

fn bind_req(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap("env", "xqd_req_new", |mut caller: Caller<'_, StoreData>, handle_out: u32| -> i32 {
        let (mut memory, instance) = match memory_and_instance(&mut caller) {
            Ok(v) => v,
            Err(e) => return e.status().code(),
        };
        let handle = req::new(instance);
        status_of(memory.write_u32(handle_out, handle).map_err(|_| XqdError::Memory))
    })?;

    linker.func_wrap(
        "env",
        "xqd_req_method_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::method_get(instance, &mut memory, handle, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_method_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, ptr: u32, len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::method_set(instance, &memory, handle, ptr, len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_uri_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::uri_get(instance, &mut memory, handle, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_uri_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, ptr: u32, len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::uri_set(instance, &memory, handle, ptr, len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_version_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, version_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::version_get(instance, &mut memory, handle, version_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_version_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, version: u32| -> i32 {
            status_of(req::version_set(instance_only(&mut caller), handle, version))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_names_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, cursor: i64, buf: u32, buf_len: u32, nwritten_out: u32, ending_cursor_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_names_get(instance, &mut memory, handle, cursor, buf, buf_len, nwritten_out, ending_cursor_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_value_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_value_get(instance, &mut memory, handle, name_ptr, name_len, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_values_get",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>,
         handle: u32,
         name_ptr: u32,
         name_len: u32,
         cursor: i64,
         buf: u32,
         buf_len: u32,
         nwritten_out: u32,
         ending_cursor_out: u32|
         -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_values_get(
                instance,
                &mut memory,
                handle,
                name_ptr,
                name_len,
                cursor,
                buf,
                buf_len,
                nwritten_out,
                ending_cursor_out,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_values_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, values_ptr: u32, values_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_values_set(instance, &memory, handle, name_ptr, name_len, values_ptr, values_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_insert",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, value_ptr: u32, value_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_insert(instance, &memory, handle, name_ptr, name_len, value_ptr, value_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_append",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, value_ptr: u32, value_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_append(instance, &memory, handle, name_ptr, name_len, value_ptr, value_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_header_remove",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::header_remove(instance, &memory, handle, name_ptr, name_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_cache_override_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, tag: u32, ttl: u32, swr: u32| -> i32 {
            status_of(req::cache_override_set(instance_only(&mut caller), handle, tag, ttl, swr))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_cache_override_v2_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, tag: u32, ttl: u32, swr: u32, sk_ptr: u32, sk_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::cache_override_v2_set(instance, &memory, handle, tag, ttl, swr, sk_ptr, sk_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_body_downstream_get",
        |mut caller: Caller<'_, StoreData>, req_handle_out: u32, body_handle_out: u32| -> i32 {
            let (mut memory, _instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::body_downstream_get(&mut memory, req_handle_out, body_handle_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_framing_headers_mode_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, mode: u32| -> i32 {
            status_of(req::framing_headers_mode_set(instance_only(&mut caller), handle, mode))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_auto_decompress_response_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, mask: u32| -> i32 {
            status_of(req::auto_decompress_response_set(instance_only(&mut caller), handle, mask))
        },
    )?;

    linker.func_wrap("env", "xqd_req_close", |mut caller: Caller<'_, StoreData>, handle: u32| -> i32 {
        status_of(req::close(instance_only(&mut caller), handle))
    })?;

    linker.func_wrap(
        "env",
        "xqd_req_register_dynamic_backend",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, name_ptr: u32, name_len: u32, target_ptr: u32, target_len: u32, cfg_ptr: u32, mask: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::register_dynamic_backend(instance, &memory, name_ptr, name_len, target_ptr, target_len, cfg_ptr, mask))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_downstream_client_ddos_detected",
        |mut caller: Caller<'_, StoreData>, out: u32| -> i32 {
            let (mut memory, _instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::downstream_client_ddos_detected(&mut memory, out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_fastly_key_is_valid",
        |mut caller: Caller<'_, StoreData>, key_ptr: u32, key_len: u32, out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::fastly_key_is_valid(instance, &mut memory, key_ptr, key_len, out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_downstream_compliance_region",
        |mut caller: Caller<'_, StoreData>, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(req::downstream_compliance_region(instance, &mut memory, buf, buf_len, nwritten_out))
        },
    )?;

    Ok(())
}

fn bind_resp(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap("env", "xqd_resp_new", |mut caller: Caller<'_, StoreData>, handle_out: u32| -> i32 {
        let (mut memory, instance) = match memory_and_instance(&mut caller) {
            Ok(v) => v,
            Err(e) => return e.status().code(),
        };
        let handle = resp::new(instance);
        status_of(memory.write_u32(handle_out, handle).map_err(|_| XqdError::Memory))
    })?;

    linker.func_wrap("env", "xqd_resp_status_get", |mut caller: Caller<'_, StoreData>, handle: u32, out: u32| -> i32 {
        let (mut memory, instance) = match memory_and_instance(&mut caller) {
            Ok(v) => v,
            Err(e) => return e.status().code(),
        };
        status_of(resp::status_get(instance, &mut memory, handle, out))
    })?;

    linker.func_wrap("env", "xqd_resp_status_set", |mut caller: Caller<'_, StoreData>, handle: u32, code: u32| -> i32 {
        status_of(resp::status_set(instance_only(&mut caller), handle, code))
    })?;

    linker.func_wrap("env", "xqd_resp_version_get", |mut caller: Caller<'_, StoreData>, handle: u32, out: u32| -> i32 {
        let (mut memory, instance) = match memory_and_instance(&mut caller) {
            Ok(v) => v,
            Err(e) => return e.status().code(),
        };
        status_of(resp::version_get(instance, &mut memory, handle, out))
    })?;

    linker.func_wrap("env", "xqd_resp_version_set", |mut caller: Caller<'_, StoreData>, handle: u32, version: u32| -> i32 {
        status_of(resp::version_set(instance_only(&mut caller), handle, version))
    })?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_names_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, cursor: i64, buf: u32, buf_len: u32, nwritten_out: u32, ending_cursor_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_names_get(instance, &mut memory, handle, cursor, buf, buf_len, nwritten_out, ending_cursor_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_value_get",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_value_get(instance, &mut memory, handle, name_ptr, name_len, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_values_get",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>,
         handle: u32,
         name_ptr: u32,
         name_len: u32,
         cursor: i64,
         buf: u32,
         buf_len: u32,
         nwritten_out: u32,
         ending_cursor_out: u32|
         -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_values_get(
                instance,
                &mut memory,
                handle,
                name_ptr,
                name_len,
                cursor,
                buf,
                buf_len,
                nwritten_out,
                ending_cursor_out,
            ))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_values_set",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, values_ptr: u32, values_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_values_set(instance, &memory, handle, name_ptr, name_len, values_ptr, values_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_insert",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, value_ptr: u32, value_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_insert(instance, &memory, handle, name_ptr, name_len, value_ptr, value_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_append",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32, value_ptr: u32, value_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_append(instance, &memory, handle, name_ptr, name_len, value_ptr, value_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_resp_header_remove",
        |mut caller: Caller<'_, StoreData>, handle: u32, name_ptr: u32, name_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(resp::header_remove(instance, &memory, handle, name_ptr, name_len))
        },
    )?;

    linker.func_wrap("env", "xqd_resp_close", |mut caller: Caller<'_, StoreData>, handle: u32| -> i32 {
        status_of(resp::close(instance_only(&mut caller), handle))
    })?;

    linker.func_wrap(
        "env",
        "xqd_resp_send_downstream",
        |mut caller: Caller<'_, StoreData>, resp_handle: u32, body_handle: u32, streaming: u32| -> i32 {
            status_of(resp::send_downstream(instance_only(&mut caller), resp_handle, body_handle, streaming != 0))
        },
    )?;

    Ok(())
}

fn bind_body(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap("env", "xqd_body_new", |mut caller: Caller<'_, StoreData>, handle_out: u32| -> i32 {
        let (mut memory, instance) = match memory_and_instance(&mut caller) {
            Ok(v) => v,
            Err(e) => return e.status().code(),
        };
        let handle = body::new(instance);
        status_of(memory.write_u32(handle_out, handle).map_err(|_| XqdError::Memory))
    })?;

    linker.func_wrap(
        "env",
        "xqd_body_read",
        |mut caller: Caller<'_, StoreData>, handle: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(body::read(instance, &mut memory, handle, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_body_write",
        move |mut caller: Caller<'_, StoreData>, (handle, ptr, len, nwritten_out): (u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(body::write(instance, &memory, handle, ptr, len, nwritten_out).await)
            })
        },
    )?;

    linker.func_wrap("env", "xqd_body_append", |mut caller: Caller<'_, StoreData>, dest: u32, src: u32| -> i32 {
        status_of(body::append(instance_only(&mut caller), dest, src))
    })?;

    linker.func_wrap("env", "xqd_body_close", |mut caller: Caller<'_, StoreData>, handle: u32| -> i32 {
        status_of(body::close(instance_only(&mut caller), handle))
    })?;

    Ok(())
}

fn bind_pending(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap_async(
        "env",
        "xqd_req_send",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>, (req_handle, body_handle, backend_ptr, backend_len, resp_handle_out, body_handle_out): (u32, u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::send(instance, &mut memory, req_handle, body_handle, backend_ptr, backend_len, resp_handle_out, body_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_req_send_async",
        move |mut caller: Caller<'_, StoreData>, (req_handle, body_handle, backend_ptr, backend_len, pending_handle_out): (u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::send_async(instance, &mut memory, req_handle, body_handle, backend_ptr, backend_len, pending_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_req_send_async_streaming",
        move |mut caller: Caller<'_, StoreData>, (req_handle, body_handle, backend_ptr, backend_len, pending_handle_out): (u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::send_async_streaming(instance, &mut memory, req_handle, body_handle, backend_ptr, backend_len, pending_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_req_send_async_v2",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>, (req_handle, body_handle, backend_ptr, backend_len, streaming, pending_handle_out): (u32, u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(
                    pending::send_async_v2(instance, &mut memory, req_handle, body_handle, backend_ptr, backend_len, streaming != 0, pending_handle_out).await,
                )
            })
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_pending_req_poll",
        |mut caller: Caller<'_, StoreData>, pending_handle: u32, is_done_out: u32, resp_handle_out: u32, body_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(pending::poll(instance, &mut memory, pending_handle, is_done_out, resp_handle_out, body_handle_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_pending_req_poll_v2",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, pending_handle: u32, error_detail_out: u32, is_done_out: u32, resp_handle_out: u32, body_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(pending::poll_v2(instance, &mut memory, pending_handle, error_detail_out, is_done_out, resp_handle_out, body_handle_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_pending_req_wait",
        move |mut caller: Caller<'_, StoreData>, (pending_handle, resp_handle_out, body_handle_out): (u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::wait(instance, &mut memory, pending_handle, resp_handle_out, body_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_pending_req_wait_v2",
        move |mut caller: Caller<'_, StoreData>, (pending_handle, error_detail_out, resp_handle_out, body_handle_out): (u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::wait_v2(instance, &mut memory, pending_handle, error_detail_out, resp_handle_out, body_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_pending_req_select",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>, (handles_ptr, handles_count, winner_index_out, resp_handle_out, body_handle_out): (u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(pending::select(instance, &mut memory, handles_ptr, handles_count, winner_index_out, resp_handle_out, body_handle_out).await)
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_pending_req_select_v2",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>,
              (handles_ptr, handles_count, winner_index_out, error_detail_out, resp_handle_out, body_handle_out): (u32, u32, u32, u32, u32, u32)|
              -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(
                    pending::select_v2(instance, &mut memory, handles_ptr, handles_count, winner_index_out, error_detail_out, resp_handle_out, body_handle_out)
                        .await,
                )
            })
        },
    )?;

    Ok(())
}

fn bind_kv(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "xqd_kv_store_open",
        |mut caller: Caller<'_, StoreData>, name_ptr: u32, name_len: u32, store_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(kv::open(instance, &mut memory, name_ptr, name_len, store_handle_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_kv_store_lookup",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, store_handle: u32, key_ptr: u32, key_len: u32, cfg_mask: u32, cfg_ptr: u32, lookup_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(kv::lookup(instance, &mut memory, store_handle, key_ptr, key_len, cfg_mask, cfg_ptr, lookup_handle_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_kv_store_lookup_wait",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>, (lookup_handle, body_handle_out, metadata_buf, metadata_max_len, metadata_len_out, generation_out, error_out): (u32, u32, u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(
                    kv::lookup_wait(instance, &mut memory, lookup_handle, body_handle_out, metadata_buf, metadata_max_len, metadata_len_out, generation_out, error_out)
                        .await,
                )
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_kv_store_lookup_wait_v2",
        #[allow(clippy::too_many_arguments)]
        move |mut caller: Caller<'_, StoreData>, (lookup_handle, body_handle_out, metadata_buf, metadata_max_len, metadata_len_out, generation_out, error_out): (u32, u32, u32, u32, u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(
                    kv::lookup_wait_v2(
                        instance,
                        &mut memory,
                        lookup_handle,
                        body_handle_out,
                        metadata_buf,
                        metadata_max_len,
                        metadata_len_out,
                        generation_out,
                        error_out,
                    )
                    .await,
                )
            })
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_kv_store_insert",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, store_handle: u32, key_ptr: u32, key_len: u32, body_handle: u32, cfg_mask: u32, cfg_ptr: u32, insert_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(kv::insert(instance, &mut memory, store_handle, key_ptr, key_len, body_handle, cfg_mask, cfg_ptr, insert_handle_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_kv_store_insert_wait",
        move |mut caller: Caller<'_, StoreData>, (insert_handle, generation_out, error_out): (u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(kv::insert_wait(instance, &mut memory, insert_handle, generation_out, error_out).await)
            })
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_kv_store_delete",
        |mut caller: Caller<'_, StoreData>, store_handle: u32, key_ptr: u32, key_len: u32, delete_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(kv::delete(instance, &mut memory, store_handle, key_ptr, key_len, delete_handle_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_kv_store_delete_wait",
        move |mut caller: Caller<'_, StoreData>, (delete_handle, error_out): (u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(kv::delete_wait(instance, &mut memory, delete_handle, error_out).await)
            })
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_kv_store_list",
        |mut caller: Caller<'_, StoreData>, store_handle: u32, cfg_mask: u32, cfg_ptr: u32, list_handle_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(kv::list(instance, &mut memory, store_handle, cfg_mask, cfg_ptr, list_handle_out))
        },
    )?;

    linker.func_wrap_async(
        "env",
        "xqd_kv_store_list_wait",
        move |mut caller: Caller<'_, StoreData>, (list_handle, body_handle_out, error_out): (u32, u32, u32)| -> BoxFuture<'_, i32> {
            Box::pin(async move {
                let (mut memory, instance) = match memory_and_instance(&mut caller) {
                    Ok(v) => v,
                    Err(e) => return e.status().code(),
                };
                status_of(kv::list_wait(instance, &mut memory, list_handle, body_handle_out, error_out).await)
            })
        },
    )?;

    Ok(())
}

fn bind_capabilities(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "xqd_geo_lookup",
        |mut caller: Caller<'_, StoreData>, addr_ptr: u32, addr_len: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::geo_lookup(instance, &mut memory, addr_ptr, addr_len, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_dictionary_open",
        |mut caller: Caller<'_, StoreData>, name_ptr: u32, name_len: u32, found_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::dictionary_open(instance, &mut memory, name_ptr, name_len, found_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_dictionary_get",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, dict_name_ptr: u32, dict_name_len: u32, key_ptr: u32, key_len: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::dictionary_get(instance, &mut memory, dict_name_ptr, dict_name_len, key_ptr, key_len, buf, buf_len, nwritten_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_log_endpoint_get",
        |mut caller: Caller<'_, StoreData>, name_ptr: u32, name_len: u32, found_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::log_endpoint_get(instance, &mut memory, name_ptr, name_len, found_out))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_log_write",
        |mut caller: Caller<'_, StoreData>, name_ptr: u32, name_len: u32, msg_ptr: u32, msg_len: u32| -> i32 {
            let (memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::log_write(instance, &memory, name_ptr, name_len, msg_ptr, msg_len))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_user_agent_parse",
        |mut caller: Caller<'_, StoreData>, ua_ptr: u32, ua_len: u32, buf: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(capabilities::user_agent_parse(instance, &mut memory, ua_ptr, ua_len, buf, buf_len, nwritten_out))
        },
    )?;

    Ok(())
}

fn bind_purge(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "xqd_purge_surrogate_key",
        #[allow(clippy::too_many_arguments)]
        |mut caller: Caller<'_, StoreData>, key_ptr: u32, key_len: u32, mask: u32, buf_ptr: u32, buf_len: u32, nwritten_out: u32| -> i32 {
            let (mut memory, _instance) = match memory_and_instance(&mut caller) {
                Ok(v) => v,
                Err(e) => return e.status().code(),
            };
            status_of(purge::purge_surrogate_key(&mut memory, key_ptr, key_len, mask, buf_ptr, buf_len, nwritten_out))
        },
    )?;

    Ok(())
}

/// Names this host recognizes but does not implement: NGWAF inspection,
/// downstream TLS introspection, and on-behalf-of delegation. Each is
/// bound at a plausible arity so guests compiled against newer SDKs that
/// merely probe for these exports still link and run (§4.K, §6
/// "`xqd_req_inspect` (returns Unsupported)").
fn bind_stubs(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "xqd_req_inspect",
        #[allow(clippy::too_many_arguments)]
        |_caller: Caller<'_, StoreData>, _req: u32, _body: u32, _buf: u32, _buf_len: u32, _nwritten_out: u32| -> i32 {
            status_of(stubs::unsupported("xqd_req_inspect"))
        },
    )?;

    linker.func_wrap(
        "env",
        "xqd_req_on_behalf_of",
        |_caller: Caller<'_, StoreData>, _handle: u32, _service_ptr: u32, _service_len: u32| -> i32 {
            status_of(stubs::unsupported("xqd_req_on_behalf_of"))
        },
    )?;

    for name in [
        "xqd_req_downstream_tls_cipher_openssl_name",
        "xqd_req_downstream_tls_protocol",
        "xqd_req_downstream_tls_client_hello",
        "xqd_req_downstream_tls_raw_client_certificate",
        "xqd_req_downstream_tls_client_cert_verify_result",
        "xqd_req_downstream_tls_ja3_md5",
    ] {
        linker.func_wrap("env", name, move |_caller: Caller<'_, StoreData>, _buf: u32, _buf_len: u32, _nwritten_out: u32| -> i32 {
            status_of(stubs::unsupported(name))
        })?;
    }

    Ok(())
}
