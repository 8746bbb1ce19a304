//! Component L: per-HTTP-request instantiation, invoking the guest's
//! `_start` export and surfacing either its `resp_send_downstream` output,
//! an empty 200 fallback, or a 500 diagnostic on trap (§4.L).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Linker, Module, Store};

use crate::abi::linking::{self, StoreData};
use crate::instance::{default_empty_response, Host, Instance};

/// Holds the pieces shared across every downstream request: the
/// `wasmtime::Engine`, the precompiled guest `Module`, and the `Linker`
/// binding the `env` ABI catalog -- all cheap to clone/share since none of
/// them carry per-request state (§4.L "the module is precompiled and
/// shared").
pub struct Program {
    engine: Engine,
    module: Module,
    linker: Linker<StoreData>,
    epoch_tick: Duration,
}

impl Program {
    /// Compiles `wasm_path` once. `epoch_tick` controls how often the
    /// background ticker task bumps the epoch counter guests are
    /// interrupted against (§4.L "Install an epoch-interruption
    /// ticker").
    pub fn load(wasm_path: impl AsRef<std::path::Path>, epoch_tick: Duration) -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;
        let module = Module::from_file(&engine, wasm_path.as_ref())?;
        let linker = linking::build_linker(&engine)?;
        Ok(Program {
            engine,
            module,
            linker,
            epoch_tick,
        })
    }

    /// Runs one downstream request to completion (§4.L). `cancelled`
    /// is the instance's derived context (§5 "Cancellation"); the
    /// driver also enforces it directly by racing `_start` against it, since
    /// a trapped epoch interruption alone would otherwise need one more
    /// guest instruction to actually fire.
    pub async fn handle_request(&self, host: Arc<Host>, downstream: http::Request<Bytes>, cancelled: CancellationToken) -> http::Response<Bytes> {
        let instance = Instance::new(host, downstream, cancelled.clone());
        let cpu_paused = instance.cpu_pause_flag();
        let store_data = StoreData::new(instance);
        let mut store = Store::new(&self.engine, store_data);
        store.set_epoch_deadline(1);
        store.epoch_deadline_trap();

        let ticker = self.spawn_epoch_ticker(cpu_paused);

        let run = async {
            let linker_instance = match self.linker.instantiate_async(&mut store, &self.module).await {
                Ok(i) => i,
                Err(e) => return Err(e),
            };
            let start = linker_instance
                .get_typed_func::<(), ()>(&mut store, "_start")
                .map_err(|e| anyhow::anyhow!(e))?;
            start.call_async(&mut store, ()).await.map_err(|e| anyhow::anyhow!(e))
        };

        let outcome = tokio::select! {
            biased;
            _ = cancelled.cancelled() => Err(anyhow::anyhow!("wasm trap: interrupt (context cancelled)")),
            result = run => result,
        };

        ticker.abort();

        match outcome {
            Ok(()) => store.into_data().instance.take_downstream_response().unwrap_or_else(default_empty_response),
            Err(trap) => trap_response(&trap),
        }
    }

    /// Bumps the engine's epoch on a fixed interval, skipping ticks while
    /// the instance has paused CPU accounting for an in-flight subrequest
    /// or KV wait (§4.G, §9).
    fn spawn_epoch_ticker(&self, cpu_paused: Arc<std::sync::atomic::AtomicBool>) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let tick = self.epoch_tick;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if !cpu_paused.load(Ordering::SeqCst) {
                    engine.increment_epoch();
                }
            }
        })
    }
}

/// Builds the 500 diagnostic response §4.L and §7 describe: body
/// begins with `"Error running wasm program"` and includes the trap
/// reason, e.g. `"wasm trap: interrupt"` on an epoch-interruption
/// cancellation.
pub fn trap_response(trap: &anyhow::Error) -> http::Response<Bytes> {
    let body = format!("Error running wasm program: {trap}");
    tracing::error!(error = %trap, "guest instantiation or execution failed");
    http::Response::builder()
        .status(http::StatusCode::INTERNAL_SERVER_ERROR)
        .body(Bytes::from(body))
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_response_carries_the_expected_substring() {
        let err = anyhow::anyhow!("wasm trap: interrupt");
        let resp = trap_response(&err);
        assert_eq!(resp.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(body.starts_with("Error running wasm program"));
        assert!(body.contains("wasm trap: interrupt"));
    }
}
