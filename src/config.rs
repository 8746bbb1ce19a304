//! TOML-backed embedder configuration (§1 "Embedder" (AMBIENT)):
//! listen address, the compiled guest module, static backends, dictionaries,
//! log endpoints and the other process-wide `Host` inputs.
//!
//! Grounded on other_examples fasttime's manifest-file shape (backends,
//! dictionaries, geolocation all declared in one config document), adapted
//! to `serde` + `toml` rather than that project's bespoke parser.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{BackendEntry, BackendRegistry, DefaultBackend, KeepaliveOptions, ReqwestBackend, Timeouts, TlsOptions};
use crate::capabilities::{Dictionaries, LogEndpoints, NullGeoLookup, UserAgentLookup, UserAgentParse};
use crate::error::XqdError;
use crate::instance::Host;

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub host_override: Option<String>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u32>,
    #[serde(default)]
    pub first_byte_timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogEndpointConfig {
    pub name: String,
    /// Path to append newline-terminated records to; `"-"` means stdout.
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DictionaryConfig {
    pub name: String,
    pub entries: HashMap<String, String>,
}

/// Top-level document loaded from `--config` (§1 (AMBIENT)).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the downstream HTTP server binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Precompiled guest module to instantiate per request.
    pub wasm_module: PathBuf,

    /// How often the epoch-interruption ticker bumps `Engine::increment_epoch`
    /// (§4.L "Install an epoch-interruption ticker").
    #[serde(default = "default_epoch_tick_ms", rename = "epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Deadline after which an in-flight instance is cancelled (§5
    /// "Cancellation": "external, ... embedder timeout").
    #[serde(default = "default_request_timeout_ms", rename = "request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub dictionaries: Vec<DictionaryConfig>,

    #[serde(default)]
    pub log_endpoints: Vec<LogEndpointConfig>,

    /// Path to a `uap-core`-style `regexes.yaml`; omit to disable
    /// `xqd_user_agent_parse`.
    #[serde(default)]
    pub user_agent_regexes: Option<PathBuf>,

    #[serde(default = "default_compliance_region")]
    pub compliance_region: String,

    #[serde(default)]
    pub fastly_keys: Vec<String>,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:7676".parse().expect("static default is valid")
}

fn default_epoch_tick_ms() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_compliance_region() -> String {
    "none".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, XqdError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| XqdError::Internal(format!("reading config: {e}")))?;
        toml::from_str(&text).map_err(|e| XqdError::Internal(format!("parsing config: {e}")))
    }

    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Builds the process-wide `Host` this config describes (§3,
    /// §4.F/H "shares...").
    pub fn build_host(&self) -> Result<Arc<Host>, XqdError> {
        let backends = BackendRegistry::new(Arc::new(DefaultBackend));
        for b in &self.backends {
            let timeouts = Timeouts {
                connect_ms: b.connect_timeout_ms,
                first_byte_ms: b.first_byte_timeout_ms,
                between_bytes_ms: None,
            };
            let handler = Arc::new(ReqwestBackend::new(&b.target, b.host_override.clone(), &timeouts)?);
            backends.register_static(BackendEntry {
                name: b.name.clone(),
                target: b.target.clone(),
                host_override: b.host_override.clone(),
                tls: TlsOptions::default(),
                timeouts,
                keepalive: KeepaliveOptions::default(),
                dynamic: false,
                handler,
            });
        }

        let mut tables = HashMap::new();
        for d in &self.dictionaries {
            tables.insert(d.name.clone(), d.entries.clone());
        }

        let loggers = LogEndpoints::default();
        for l in &self.log_endpoints {
            let writer: Box<dyn std::io::Write + Send> = if l.path == "-" {
                Box::new(std::io::stdout())
            } else {
                Box::new(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&l.path)
                        .map_err(|e| XqdError::Internal(format!("opening log endpoint {}: {e}", l.name)))?,
                )
            };
            loggers.register(l.name.clone(), writer);
        }

        let user_agent: Option<Arc<dyn UserAgentParse>> = self
            .user_agent_regexes
            .as_ref()
            .map(UserAgentLookup::from_path)
            .transpose()?
            .map(|parser| Arc::new(parser) as Arc<dyn UserAgentParse>);

        Ok(Arc::new(Host {
            backends,
            geo: Arc::new(NullGeoLookup),
            dictionaries: Dictionaries::new(tables),
            loggers,
            user_agent,
            kv_stores: crate::kv::KvStoreRegistry::new(),
            compliance_region: self.compliance_region.clone(),
            fastly_keys: self.fastly_keys.iter().cloned().collect(),
        }))
    }
}
