//! Binary entry point: parses the CLI, loads config, compiles the guest
//! module, and serves it over HTTP (§1 "Embedder" (AMBIENT)).

use std::sync::Arc;

use axum::extract::State;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use xqd_host::cli::Cli;
use xqd_host::config::Config;
use xqd_host::driver::Program;
use xqd_host::instance::Host;

#[derive(Clone)]
struct AppState {
    program: Arc<Program>,
    host: Arc<Host>,
    request_timeout: std::time::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())))
        .init();

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let host = config.build_host()?;
    let program = Arc::new(Program::load(&config.wasm_module, config.epoch_tick())?);
    let request_timeout = config.request_timeout();

    let state = AppState {
        program,
        host,
        request_timeout,
    };

    let app = axum::Router::new().fallback(handle).with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, "xqd-host listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Translates one downstream HTTP request into an `Instance`-driven guest
/// run (§4.L), deriving a timeout-bounded cancellation context
/// (§5 "Cancellation").
async fn handle(State(state): State<AppState>, req: http::Request<axum::body::Body>) -> http::Response<axum::body::Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return http::Response::builder()
                .status(http::StatusCode::BAD_REQUEST)
                .body(axum::body::Body::from(format!("failed to read request body: {e}")))
                .expect("static response is well-formed");
        }
    };
    let downstream = http::Request::from_parts(parts, body_bytes);

    let cancelled = CancellationToken::new();
    let timeout_guard = {
        let cancelled = cancelled.clone();
        let timeout = state.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancelled.cancel();
        })
    };

    let response = state.program.handle_request(state.host.clone(), downstream, cancelled).await;
    timeout_guard.abort();

    response.map(axum::body::Body::from)
}
