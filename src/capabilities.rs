//! Component H: geolocation, dictionary, logger and user-agent parsing --
//! pure injected capabilities shared process-wide (§3 "shares...",
//! §4.H).

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use user_agent_parser::UserAgentParser;

use crate::error::XqdError;

/// A geolocation record, serialized to JSON for the guest (§4.H).
/// Field set matches what a Fastly guest SDK's `geo_lookup` consumer
/// typically decodes; unknown fields are left `None` rather than
/// fabricated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoRecord {
    pub as_name: Option<String>,
    pub as_number: Option<u32>,
    pub area_code: Option<u32>,
    pub city: Option<String>,
    pub conn_speed: Option<String>,
    pub continent: Option<String>,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub region: Option<String>,
}

/// Injected geolocation capability: a pure function from an IP address to
/// a record. The default implementation always returns an empty record;
/// embedders supply their own via `HostConfig`.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, addr: IpAddr) -> GeoRecord;
}

pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn lookup(&self, _addr: IpAddr) -> GeoRecord {
        GeoRecord::default()
    }
}

/// `geo_lookup` accepts a raw address of 4 or 16 bytes; anything else is
/// `InvalidArgument` (§4.H, §8).
pub fn validate_addr_len(len: usize) -> Result<(), XqdError> {
    if len != 4 && len != 16 {
        return Err(XqdError::InvalidArgument(format!(
            "addr_len must be 4 or 16, got {len}"
        )));
    }
    Ok(())
}

pub fn addr_from_octets(bytes: &[u8]) -> Result<IpAddr, XqdError> {
    validate_addr_len(bytes.len())?;
    match bytes.len() {
        4 => {
            let mut a = [0u8; 4];
            a.copy_from_slice(bytes);
            Ok(IpAddr::from(a))
        }
        16 => {
            let mut a = [0u8; 16];
            a.copy_from_slice(bytes);
            Ok(IpAddr::from(a))
        }
        _ => unreachable!("validated above"),
    }
}

/// Name -> key -> value dictionary lookups (§4.H).
#[derive(Default)]
pub struct Dictionaries {
    tables: HashMap<String, HashMap<String, String>>,
}

impl Dictionaries {
    pub fn new(tables: HashMap<String, HashMap<String, String>>) -> Self {
        Dictionaries { tables }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get(&self, name: &str, key: &str) -> Option<&str> {
        self.tables.get(name)?.get(key).map(String::as_str)
    }
}

/// Named log writers (§3, §4.H). Each endpoint appends
/// newline-terminated records, in the same spirit as using `tracing`
/// spans/events for structured output -- here the guest
/// supplies raw bytes instead of a tracing event, so we fall back to a
/// plain buffered writer per endpoint.
pub struct LogEndpoints {
    endpoints: RwLock<HashMap<String, Mutex<Box<dyn Write + Send>>>>,
}

impl Default for LogEndpoints {
    fn default() -> Self {
        LogEndpoints {
            endpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl LogEndpoints {
    pub fn register(&self, name: impl Into<String>, writer: Box<dyn Write + Send>) {
        self.endpoints
            .write()
            .unwrap()
            .insert(name.into(), Mutex::new(writer));
    }

    /// `log_endpoint_get`: reports whether an endpoint of this name was
    /// configured, without writing anything (§4.H).
    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.read().unwrap().contains_key(name)
    }

    /// `log_endpoint_get` + `log_write`: appends `msg` followed by a
    /// newline to the endpoint's writer (§8 scenario "log").
    pub fn write(&self, name: &str, msg: &str) -> Result<(), XqdError> {
        let endpoints = self.endpoints.read().unwrap();
        let writer = endpoints
            .get(name)
            .ok_or_else(|| XqdError::InvalidArgument(format!("no such log endpoint: {name}")))?;
        let mut writer = writer.lock().unwrap();
        writer
            .write_all(msg.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| XqdError::Internal(e.to_string()))
    }
}

/// User-agent -> {family, major, minor, patch} (§4.H).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAgentInfo {
    pub family: String,
    pub major: Option<String>,
    pub minor: Option<String>,
    pub patch: Option<String>,
}

/// Injected user-agent parsing capability, mirroring `GeoLookup`'s
/// trait-over-concrete-implementation shape so tests can swap in canned
/// results without a real `uap-core` regex file.
pub trait UserAgentParse: Send + Sync {
    fn parse(&self, ua: &str) -> UserAgentInfo;
}

pub struct UserAgentLookup {
    parser: UserAgentParser,
}

impl UserAgentLookup {
    /// Loads the `uap-core` regex definitions the `user-agent-parser`
    /// crate expects (a `regexes.yaml` file) from `path`.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self, XqdError> {
        let parser = UserAgentParser::from_path(path)
            .map_err(|e| XqdError::Internal(format!("invalid UA regexes: {e}")))?;
        Ok(UserAgentLookup { parser })
    }
}

impl UserAgentParse for UserAgentLookup {
    fn parse(&self, ua: &str) -> UserAgentInfo {
        let product = self.parser.parse_product(ua);
        UserAgentInfo {
            family: product.name.map(|c| c.into_owned()).unwrap_or_else(|| "Other".to_string()),
            major: product.major.map(|c| c.into_owned()),
            minor: product.minor.map(|c| c.into_owned()),
            patch: product.patch.map(|c| c.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_len_must_be_4_or_16() {
        assert!(validate_addr_len(4).is_ok());
        assert!(validate_addr_len(16).is_ok());
        assert!(validate_addr_len(6).is_err());
    }

    #[test]
    fn dictionary_lookup() {
        let mut tables = HashMap::new();
        let mut t = HashMap::new();
        t.insert("testkey".to_string(), "Hello from the dictionary".to_string());
        tables.insert("testdict".to_string(), t);
        let dict = Dictionaries::new(tables);
        assert_eq!(dict.get("testdict", "testkey"), Some("Hello from the dictionary"));
        assert_eq!(dict.get("testdict", "missing"), None);
    }

    #[test]
    fn log_endpoint_roundtrip() {
        let endpoints = LogEndpoints::default();
        let buf: Vec<u8> = Vec::new();
        let shared = std::sync::Arc::new(Mutex::new(buf));
        struct SharedWriter(std::sync::Arc<Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        endpoints.register("default", Box::new(SharedWriter(shared.clone())));
        endpoints.write("default", "Hello from fastlike!").unwrap();
        let out = shared.lock().unwrap().clone();
        assert_eq!(String::from_utf8(out).unwrap(), "Hello from fastlike!\n");
    }
}
