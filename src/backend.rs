//! Component F: named backends, static and dynamically registered
//! (§3 "Backend", §4.F, §6 "DynamicBackendConfig").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use http::Request;

use crate::error::XqdError;
use crate::memory::MemoryView;

/// A handler for a named backend. `send` performs (or simulates) the
/// actual network round-trip, following the `tower::Service`-style pattern
/// of abstracting "the thing that answers an HTTP request" away from any
/// one transport.
#[async_trait]
pub trait BackendHandler: Send + Sync {
    async fn send(&self, req: Request<reqwest::Body>) -> Result<http::Response<reqwest::Body>, XqdError>;
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub min_version: Option<u32>,
    pub max_version: Option<u32>,
    pub cert_hostname: Option<String>,
    pub ca_cert: Option<String>,
    pub ciphers: Option<String>,
    pub sni_hostname: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Timeouts {
    pub connect_ms: Option<u32>,
    pub first_byte_ms: Option<u32>,
    pub between_bytes_ms: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct KeepaliveOptions {
    pub http_keepalive_time_ms: Option<u32>,
    pub tcp_keepalive_enable: Option<bool>,
    pub tcp_keepalive_interval_s: Option<u32>,
    pub tcp_keepalive_probes: Option<u32>,
    pub tcp_keepalive_time_s: Option<u32>,
}

pub struct BackendEntry {
    pub name: String,
    pub target: String,
    pub host_override: Option<String>,
    pub tls: TlsOptions,
    pub timeouts: Timeouts,
    pub keepalive: KeepaliveOptions,
    pub dynamic: bool,
    pub handler: Arc<dyn BackendHandler>,
}

/// Round-trips an incoming request through `reqwest`, rewriting its
/// scheme/host to the registered target and applying any host override
/// (§4.F: "construct a handler that rewrites the incoming request's
/// scheme/host ... and round-trips the request through an outgoing HTTP
/// client").
pub struct ReqwestBackend {
    client: reqwest::Client,
    target: url::Url,
    host_override: Option<String>,
}

impl ReqwestBackend {
    pub fn new(target: &str, host_override: Option<String>, timeouts: &Timeouts) -> Result<Self, XqdError> {
        let target = url::Url::parse(target)
            .map_err(|e| XqdError::InvalidArgument(format!("bad backend target: {e}")))?;
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = timeouts.connect_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms as u64));
        }
        if let Some(ms) = timeouts.first_byte_ms.or(timeouts.between_bytes_ms) {
            builder = builder.timeout(Duration::from_millis(ms as u64));
        }
        let client = builder
            .build()
            .map_err(|e| XqdError::Internal(format!("failed to build http client: {e}")))?;
        Ok(ReqwestBackend {
            client,
            target,
            host_override,
        })
    }
}

#[async_trait]
impl BackendHandler for ReqwestBackend {
    async fn send(&self, req: Request<reqwest::Body>) -> Result<http::Response<reqwest::Body>, XqdError> {
        let (mut parts, body) = req.into_parts();

        let mut url = self.target.clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        if let Some(host) = &self.host_override {
            parts
                .headers
                .insert(http::header::HOST, http::HeaderValue::from_str(host).map_err(|_| {
                    XqdError::InvalidArgument("invalid host override".to_string())
                })?);
        }

        let mut req_builder = self
            .client
            .request(parts.method, url)
            .headers(parts.headers);
        req_builder = req_builder.body(body);

        let resp = req_builder
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = reqwest::Body::wrap_stream(resp.bytes_stream());

        let mut builder = http::Response::builder().status(status).version(version);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        builder
            .body(body)
            .map_err(|e| XqdError::Internal(e.to_string()))
    }
}

/// Plain-send path only needs a diagnostic `XqdError`; the richer
/// `SendErrorTag`/`SendErrorDetail` classification used by the `_v2`/`_v3`
/// subrequest variants lives in `subrequest::classify_transport_error`.
fn classify_transport_error(e: &reqwest::Error) -> XqdError {
    XqdError::Internal(format!("backend request failed: {e}"))
}

/// `getBackendHandler`: returns the registered handler, or the default
/// fallback factory (§4.F). The special name `"geolocation"` never
/// reaches `get` at all: `subrequest::run_send` intercepts it and routes
/// to `Host::geo` before consulting this registry.
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<BackendEntry>>>,
    default: Arc<dyn BackendHandler>,
}

impl BackendRegistry {
    pub fn new(default: Arc<dyn BackendHandler>) -> Self {
        BackendRegistry {
            backends: RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn register_static(&self, entry: BackendEntry) {
        self.backends
            .write()
            .unwrap()
            .insert(entry.name.clone(), Arc::new(entry));
    }

    pub fn get(&self, name: &str) -> Arc<dyn BackendHandler> {
        self.backends
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.handler.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.backends.read().unwrap().contains_key(name)
    }

    /// `req_register_dynamic_backend`: fails with `InvalidArgument` if the
    /// name already exists (§4.F).
    pub fn register_dynamic(&self, name: String, cfg: DynamicBackendConfig) -> Result<(), XqdError> {
        if self.exists(&name) {
            return Err(XqdError::InvalidArgument(format!(
                "backend {name} already registered"
            )));
        }
        let target = cfg
            .target
            .clone()
            .ok_or_else(|| XqdError::InvalidArgument("dynamic backend missing target".into()))?;
        let handler = Arc::new(ReqwestBackend::new(&target, cfg.host_override.clone(), &cfg.timeouts)?);
        self.register_static(BackendEntry {
            name,
            target,
            host_override: cfg.host_override,
            tls: cfg.tls,
            timeouts: cfg.timeouts,
            keepalive: cfg.keepalive,
            dynamic: true,
            handler,
        });
        Ok(())
    }
}

/// A default backend that always returns 502, used when no backend is
/// registered and the name is unknown (§4.F).
pub struct DefaultBackend;

#[async_trait]
impl BackendHandler for DefaultBackend {
    async fn send(&self, _req: Request<reqwest::Body>) -> Result<http::Response<reqwest::Body>, XqdError> {
        http::Response::builder()
            .status(http::StatusCode::BAD_GATEWAY)
            .body(reqwest::Body::from("no such backend"))
            .map_err(|e| XqdError::Internal(e.to_string()))
    }
}

/// Bit positions within `DynamicBackendConfig`'s mask (§6).
pub mod mask_bits {
    pub const HOST_OVERRIDE: u32 = 1 << 0;
    pub const CONNECT_TIMEOUT: u32 = 1 << 1;
    pub const FIRST_BYTE_TIMEOUT: u32 = 1 << 2;
    pub const BETWEEN_BYTES_TIMEOUT: u32 = 1 << 3;
    pub const USE_SSL: u32 = 1 << 4;
    pub const SSL_MIN_VERSION: u32 = 1 << 5;
    pub const SSL_MAX_VERSION: u32 = 1 << 6;
    pub const CERT_HOSTNAME: u32 = 1 << 7;
    pub const CA_CERT: u32 = 1 << 8;
    pub const CIPHERS: u32 = 1 << 9;
    pub const SNI_HOSTNAME: u32 = 1 << 10;
    pub const CLIENT_CERT: u32 = 1 << 11;
    pub const KEEPALIVE: u32 = 1 << 12;
    pub const RESERVED: u32 = 1 << 31;
}

#[derive(Debug, Clone, Default)]
pub struct DynamicBackendConfig {
    pub target: Option<String>,
    pub host_override: Option<String>,
    pub tls: TlsOptions,
    pub timeouts: Timeouts,
    pub keepalive: KeepaliveOptions,
}

/// Reads the 96-byte, 24 x u32 `DynamicBackendConfig` struct at `ptr`
/// (§4.F, §6). `target` itself is passed as the guest's separate
/// `(addr, len)` pair to `req_register_dynamic_backend`, not as part of
/// this struct -- it is read by the caller and stashed onto the result.
pub fn read_dynamic_backend_config(
    memory: &dyn MemoryView,
    ptr: u32,
    mask: u32,
) -> Result<DynamicBackendConfig, XqdError> {
    if mask & mask_bits::RESERVED != 0 {
        return Err(XqdError::InvalidArgument(
            "reserved mask bit set".to_string(),
        ));
    }

    let mut cfg = DynamicBackendConfig::default();

    let read_str = |off: u32, len_off: u32| -> Result<Option<String>, XqdError> {
        let ptr = memory.read_u32(off)?;
        let len = memory.read_u32(len_off)?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(memory.read_string(ptr, len)?))
    };

    if mask & mask_bits::HOST_OVERRIDE != 0 {
        cfg.host_override = read_str(ptr, ptr + 4)?;
    }
    if mask & mask_bits::CONNECT_TIMEOUT != 0 {
        cfg.timeouts.connect_ms = Some(memory.read_u32(ptr + 8)?);
    }
    if mask & mask_bits::FIRST_BYTE_TIMEOUT != 0 {
        cfg.timeouts.first_byte_ms = Some(memory.read_u32(ptr + 12)?);
    }
    if mask & mask_bits::BETWEEN_BYTES_TIMEOUT != 0 {
        cfg.timeouts.between_bytes_ms = Some(memory.read_u32(ptr + 16)?);
    }
    if mask & mask_bits::SSL_MIN_VERSION != 0 {
        cfg.tls.min_version = Some(memory.read_u32(ptr + 20)?);
    }
    if mask & mask_bits::SSL_MAX_VERSION != 0 {
        cfg.tls.max_version = Some(memory.read_u32(ptr + 24)?);
    }
    if mask & mask_bits::CERT_HOSTNAME != 0 {
        cfg.tls.cert_hostname = read_str(ptr + 28, ptr + 32)?;
    }
    if mask & mask_bits::CA_CERT != 0 {
        cfg.tls.ca_cert = read_str(ptr + 36, ptr + 40)?;
    }
    if mask & mask_bits::CIPHERS != 0 {
        cfg.tls.ciphers = read_str(ptr + 44, ptr + 48)?;
    }
    if mask & mask_bits::SNI_HOSTNAME != 0 {
        cfg.tls.sni_hostname = read_str(ptr + 52, ptr + 56)?;
    }
    if mask & mask_bits::CLIENT_CERT != 0 {
        cfg.tls.client_certificate = read_str(ptr + 60, ptr + 64)?;
        cfg.tls.client_key = Some(memory.read_u32(ptr + 68)?);
    }
    if mask & mask_bits::KEEPALIVE != 0 {
        cfg.keepalive.http_keepalive_time_ms = Some(memory.read_u32(ptr + 72)?);
        cfg.keepalive.tcp_keepalive_enable = Some(memory.read_u32(ptr + 76)? != 0);
        cfg.keepalive.tcp_keepalive_interval_s = Some(memory.read_u32(ptr + 80)?);
        cfg.keepalive.tcp_keepalive_probes = Some(memory.read_u32(ptr + 84)?);
        cfg.keepalive.tcp_keepalive_time_s = Some(memory.read_u32(ptr + 88)?);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn reserved_bit_is_rejected() {
        let mem = FlatMemory::with_size(96);
        let err = read_dynamic_backend_config(&mem, 0, mask_bits::RESERVED).unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[test]
    fn registering_same_name_twice_fails() {
        let registry = BackendRegistry::new(Arc::new(DefaultBackend));
        let cfg = DynamicBackendConfig {
            target: Some("https://example.com".to_string()),
            ..Default::default()
        };
        registry.register_dynamic("b1".to_string(), cfg.clone()).unwrap();
        let err = registry.register_dynamic("b1".to_string(), cfg).unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_backend_falls_back_to_default() {
        let registry = BackendRegistry::new(Arc::new(DefaultBackend));
        assert!(!registry.exists("nope"));
        let _ = registry.get("nope");
    }
}
