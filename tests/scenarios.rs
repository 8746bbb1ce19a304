//! End-to-end scenario tests (§8). A compiled guest `.wasm` module is
//! out of scope for this host's test suite, so each scenario is scripted
//! at the `Instance`/`abi::*` level: the same sequence of host calls a
//! guest program would have triggered via the ABI, asserting on the
//! resulting downstream `http::Response`.
//!
//! Scenario 10 ("panic") is covered by `driver::tests::trap_response_carries_the_expected_substring`,
//! since it exercises the driver's trap path rather than any ABI call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Request as HttpRequest;
use tokio_util::sync::CancellationToken;

use xqd_host::abi::{capabilities as cap_abi, req, resp};
use xqd_host::backend::{BackendEntry, BackendHandler, BackendRegistry, DefaultBackend, KeepaliveOptions, TlsOptions, Timeouts};
use xqd_host::capabilities::{Dictionaries, GeoLookup, GeoRecord, LogEndpoints, NullGeoLookup, UserAgentInfo, UserAgentParse};
use xqd_host::driver::trap_response;
use xqd_host::instance::{Host, Instance};
use xqd_host::kv::KvStoreRegistry;
use xqd_host::memory::{FlatMemory, MemoryView};
use xqd_host::subrequest;

fn bare_host() -> Arc<Host> {
    Arc::new(Host {
        backends: BackendRegistry::new(Arc::new(DefaultBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    })
}

fn downstream_get(uri: &str) -> HttpRequest<Bytes> {
    HttpRequest::builder().method("GET").uri(uri).body(Bytes::new()).unwrap()
}

fn instance_for(host: Arc<Host>, uri: &str) -> Instance {
    Instance::new(host, downstream_get(uri), CancellationToken::new())
}

/// Scenario 1: GET `/simple-response`, guest calls `resp_send_downstream`
/// with body "Hello, world!" and status 200.
#[test]
fn simple_response() {
    let mut instance = instance_for(bare_host(), "/simple-response");
    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 200).unwrap();

    let body_handle = instance.new_body();
    instance.bodies.get_mut(body_handle).unwrap().append(b"Hello, world!").unwrap();

    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();
    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 200);
    assert_eq!(downstream.body(), &Bytes::from_static(b"Hello, world!"));
}

/// Scenario 2: GET `/no-body` ⇒ 204 with empty body.
#[test]
fn no_body() {
    let mut instance = instance_for(bare_host(), "/no-body");
    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 204).unwrap();
    let body_handle = instance.new_body();

    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();
    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 204);
    assert!(downstream.body().is_empty());
}

/// Scenario 3: GET `/append-body` ⇒ 200 with body exactly
/// `"original\nappended"` (`body_append`).
#[test]
fn append_body() {
    use xqd_host::abi::body;

    let mut instance = instance_for(bare_host(), "/append-body");
    let original = body::new(&mut instance);
    let extra = body::new(&mut instance);
    instance.bodies.get_mut(original).unwrap().append(b"original\n").unwrap();
    instance.bodies.get_mut(extra).unwrap().append(b"appended").unwrap();
    body::append(&mut instance, original, extra).unwrap();

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 200).unwrap();
    resp::send_downstream(&mut instance, resp_handle, original, false).unwrap();

    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 200);
    assert_eq!(downstream.body(), &Bytes::from_static(b"original\nappended"));
}

/// Scenario 4: GET `/user-agent` with a Firefox UA string, parser returns
/// {Firefox,76,1,15} ⇒ body `"Firefox 76.1.15"`. A canned `UserAgentParse`
/// stands in for a real `uap-core` regex file, which this repo does not
/// vendor.
struct CannedUserAgent;

impl UserAgentParse for CannedUserAgent {
    fn parse(&self, _ua: &str) -> UserAgentInfo {
        UserAgentInfo {
            family: "Firefox".to_string(),
            major: Some("76".to_string()),
            minor: Some("1".to_string()),
            patch: Some("15".to_string()),
        }
    }
}

#[test]
fn user_agent() {
    let host = Arc::new(Host {
        backends: BackendRegistry::new(Arc::new(DefaultBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: Some(Arc::new(CannedUserAgent)),
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host, "/user-agent");

    let ua = b"Mozilla/5.0 (X11; Fedora; Linux x86_64; rv:76.0) Gecko/20100101 Firefox/76.1.15";
    let mut mem = FlatMemory::with_size(512);
    mem.write_at(0, ua).unwrap();
    cap_abi::user_agent_parse(&instance, &mut mem, 0, ua.len() as u32, 100, 300, 400).unwrap();
    let len = mem.read_u32(400).unwrap();
    let json = mem.read_string(100, len).unwrap();
    let info: UserAgentInfo = serde_json::from_str(&json).unwrap();

    let body = format!(
        "{} {}.{}.{}",
        info.family,
        info.major.unwrap(),
        info.minor.unwrap(),
        info.patch.unwrap()
    );
    assert_eq!(body, "Firefox 76.1.15");

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 200).unwrap();
    let body_handle = instance.new_body();
    instance.bodies.get_mut(body_handle).unwrap().append(body.as_bytes()).unwrap();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();

    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.body(), &Bytes::from("Firefox 76.1.15"));
}

struct TeapotBackend;

#[async_trait]
impl BackendHandler for TeapotBackend {
    async fn send(&self, _req: HttpRequest<reqwest::Body>) -> Result<http::Response<reqwest::Body>, xqd_host::XqdError> {
        http::Response::builder()
            .status(418)
            .body(reqwest::Body::from("i am a teapot"))
            .map_err(|e| xqd_host::XqdError::Internal(e.to_string()))
    }
}

fn registry_with(name: &str, handler: Arc<dyn BackendHandler>) -> BackendRegistry {
    let registry = BackendRegistry::new(Arc::new(DefaultBackend));
    registry.register_static(BackendEntry {
        name: name.to_string(),
        target: "http://backend.invalid".to_string(),
        host_override: None,
        tls: TlsOptions::default(),
        timeouts: Timeouts::default(),
        keepalive: KeepaliveOptions::default(),
        dynamic: false,
        handler,
    });
    registry
}

/// Scenario 5: GET `/proxy`, default backend handler responds 418 / "i am
/// a teapot" ⇒ downstream sees 418 / "i am a teapot". A unit-level version
/// of this path already lives in `subrequest::tests`; this exercises the
/// full chain through `resp_send_downstream`.
#[tokio::test]
async fn proxy() {
    let host = Arc::new(Host {
        backends: registry_with("teapot", Arc::new(TeapotBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host.clone(), "/proxy");

    let req_handle = req::new(&mut instance);
    let mut mem = FlatMemory::with_size(64);
    mem.write_at(0, b"https://example.com/").unwrap();
    req::uri_set(&mut instance, &mem, req_handle, 0, 20).unwrap();
    let req_state = instance.requests.get(req_handle).unwrap().clone();

    let cancelled = CancellationToken::new();
    let outcome = subrequest::send_synchronous(&host, "teapot", &req_state, Bytes::new(), 0, &cancelled)
        .await
        .unwrap();

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, outcome.status().as_u16() as u32).unwrap();
    let body_handle = instance.new_body();
    instance.bodies.get_mut(body_handle).unwrap().append(outcome.body()).unwrap();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();

    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 418);
    assert_eq!(downstream.body(), &Bytes::from_static(b"i am a teapot"));
}

struct AssertHeaderBackend;

#[async_trait]
impl BackendHandler for AssertHeaderBackend {
    async fn send(&self, req: HttpRequest<reqwest::Body>) -> Result<http::Response<reqwest::Body>, xqd_host::XqdError> {
        let ok = req.headers().get("test-header").map(|v| v == "test-value").unwrap_or(false);
        let status = if ok { 204 } else { 500 };
        http::Response::builder()
            .status(status)
            .body(reqwest::Body::from(""))
            .map_err(|e| xqd_host::XqdError::Internal(e.to_string()))
    }
}

/// Scenario 6: GET `/append-header`, backend asserts incoming header
/// `test-header: test-value` is present ⇒ 204.
#[tokio::test]
async fn append_header() {
    let host = Arc::new(Host {
        backends: registry_with("asserter", Arc::new(AssertHeaderBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host.clone(), "/append-header");

    let req_handle = req::new(&mut instance);
    let mut mem = FlatMemory::with_size(64);
    mem.write_at(0, b"https://example.com/").unwrap();
    req::uri_set(&mut instance, &mem, req_handle, 0, 20).unwrap();
    mem.write_at(30, b"test-header").unwrap();
    mem.write_at(50, b"test-value").unwrap();
    req::header_append(&mut instance, &mem, req_handle, 30, 11, 50, 10).unwrap();
    let req_state = instance.requests.get(req_handle).unwrap().clone();

    let cancelled = CancellationToken::new();
    let outcome = subrequest::send_synchronous(&host, "asserter", &req_state, Bytes::new(), 0, &cancelled)
        .await
        .unwrap();

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, outcome.status().as_u16() as u32).unwrap();
    let body_handle = instance.new_body();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();

    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 204);
}

struct FastlikeGeo;

impl GeoLookup for FastlikeGeo {
    fn lookup(&self, _addr: IpAddr) -> GeoRecord {
        GeoRecord {
            as_name: Some("fastlike".to_string()),
            ..GeoRecord::default()
        }
    }
}

/// Scenario 7: GET `/geo`, `RemoteAddr=127.0.0.1:9999`, geolookup returns
/// `{as_name:"fastlike", ...}` ⇒ JSON body decoding yields
/// `as_name == "fastlike"`.
#[test]
fn geo() {
    let host = Arc::new(Host {
        backends: BackendRegistry::new(Arc::new(DefaultBackend)),
        geo: Arc::new(FastlikeGeo),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host, "/geo");

    let mut mem = FlatMemory::with_size(256);
    mem.write_at(0, &[127, 0, 0, 1]).unwrap();
    cap_abi::geo_lookup(&instance, &mut mem, 0, 4, 100, 150, 260).unwrap();
    let len = mem.read_u32(260).unwrap();
    let json = mem.read_string(100, len).unwrap();
    let record: GeoRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(record.as_name.as_deref(), Some("fastlike"));

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 200).unwrap();
    let body_handle = instance.new_body();
    instance.bodies.get_mut(body_handle).unwrap().append(json.as_bytes()).unwrap();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();
    let downstream = instance.take_downstream_response().unwrap();
    assert!(String::from_utf8(downstream.body().to_vec()).unwrap().contains("\"as_name\":\"fastlike\""));
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Scenario 8: GET `/log`, logger "default" bound to a buffer ⇒ buffer
/// contains `"Hello from fastlike!\n"` and response is 204.
#[test]
fn log() {
    let loggers = LogEndpoints::default();
    let buf = Arc::new(Mutex::new(Vec::new()));
    loggers.register("default", Box::new(SharedWriter(buf.clone())));

    let host = Arc::new(Host {
        backends: BackendRegistry::new(Arc::new(DefaultBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers,
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host, "/log");

    let mut mem = FlatMemory::with_size(64);
    mem.write_at(0, b"default").unwrap();
    mem.write_at(20, b"Hello from fastlike!").unwrap();
    cap_abi::log_write(&instance, &mem, 0, 7, 20, 20).unwrap();
    assert_eq!(String::from_utf8(buf.lock().unwrap().clone()).unwrap(), "Hello from fastlike!\n");

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 204).unwrap();
    let body_handle = instance.new_body();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();
    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.status(), 204);
}

/// Scenario 9: GET `/dictionary/testdict/testkey` with
/// dict{"testkey"→"Hello from the dictionary"} ⇒ body
/// `"Hello from the dictionary"`.
#[test]
fn dictionary() {
    let mut tables = HashMap::new();
    let mut inner = HashMap::new();
    inner.insert("testkey".to_string(), "Hello from the dictionary".to_string());
    tables.insert("testdict".to_string(), inner);

    let host = Arc::new(Host {
        backends: BackendRegistry::new(Arc::new(DefaultBackend)),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::new(tables),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });
    let mut instance = instance_for(host, "/dictionary/testdict/testkey");

    let mut mem = FlatMemory::with_size(256);
    mem.write_at(0, b"testdict").unwrap();
    mem.write_at(20, b"testkey").unwrap();
    cap_abi::dictionary_get(&instance, &mut mem, 0, 8, 20, 7, 100, 50, 200).unwrap();
    let len = mem.read_u32(200).unwrap();
    let value = mem.read_string(100, len).unwrap();

    let resp_handle = resp::new(&mut instance);
    resp::status_set(&mut instance, resp_handle, 200).unwrap();
    let body_handle = instance.new_body();
    instance.bodies.get_mut(body_handle).unwrap().append(value.as_bytes()).unwrap();
    resp::send_downstream(&mut instance, resp_handle, body_handle, false).unwrap();

    let downstream = instance.take_downstream_response().unwrap();
    assert_eq!(downstream.body(), &Bytes::from_static(b"Hello from the dictionary"));
}

/// Scenario 10: GET `/panic!` triggers a guest trap ⇒ 500 with body
/// containing "Error running wasm program". Exercised directly against
/// `driver::trap_response`, the function the driver's `_start` failure
/// path converts any guest trap into (the epoch-interruption and
/// instantiation-failure cases share this same conversion).
#[test]
fn panic() {
    let trap = anyhow::anyhow!("wasm trap: unreachable");
    let response = trap_response(&trap);
    assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(body.starts_with("Error running wasm program"));
    assert!(body.contains("wasm trap: unreachable"));
}

struct SlowBackend {
    delay: Duration,
}

#[async_trait]
impl BackendHandler for SlowBackend {
    async fn send(&self, _req: HttpRequest<reqwest::Body>) -> Result<http::Response<reqwest::Body>, xqd_host::XqdError> {
        tokio::time::sleep(self.delay).await;
        http::Response::builder()
            .status(200)
            .body(reqwest::Body::from("slow response"))
            .map_err(|e| xqd_host::XqdError::Internal(e.to_string()))
    }
}

/// Scenario 11: 5 concurrent requests to `/proxy` where the backend
/// sleeps 500 ms each: all must complete and each return the backend's
/// response (verifies instance isolation and concurrent drive).
#[tokio::test]
async fn parallel() {
    let host = Arc::new(Host {
        backends: registry_with(
            "slow",
            Arc::new(SlowBackend {
                delay: Duration::from_millis(500),
            }),
        ),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });

    let mut req_state = xqd_host::request::RequestState::default();
    req_state.set_url(b"https://example.com/proxy").unwrap();

    let started = tokio::time::Instant::now();
    let sends = (0..5).map(|_| {
        let host = host.clone();
        let req_state = req_state.clone();
        tokio::spawn(async move {
            let cancelled = CancellationToken::new();
            subrequest::send_synchronous(&host, "slow", &req_state, Bytes::new(), 0, &cancelled).await
        })
    });

    let results = futures_util::future::join_all(sends).await;
    for joined in results {
        let outcome = joined.unwrap().unwrap();
        assert_eq!(outcome.status(), 200);
        assert_eq!(outcome.body(), &Bytes::from_static(b"slow response"));
    }
    // All 5 ran concurrently rather than serially (5 x 500ms would be 2.5s).
    assert!(started.elapsed() < Duration::from_millis(1500));
}

/// Scenario 12: GET `/proxy` with a 50 ms timeout context; backend sleeps
/// 100 ms ⇒ 500 with body containing `"wasm trap: interrupt"`. This
/// reproduces the driver's own race (`tokio::select!` between `_start`
/// and the derived cancellation context) directly against the subrequest
/// layer, since no compiled guest is available to actually trap.
#[tokio::test]
async fn context_cancel() {
    let host = Arc::new(Host {
        backends: registry_with(
            "slow",
            Arc::new(SlowBackend {
                delay: Duration::from_millis(100),
            }),
        ),
        geo: Arc::new(NullGeoLookup),
        dictionaries: Dictionaries::default(),
        loggers: LogEndpoints::default(),
        user_agent: None,
        kv_stores: KvStoreRegistry::new(),
        compliance_region: "none".to_string(),
        fastly_keys: Default::default(),
    });

    let mut req_state = xqd_host::request::RequestState::default();
    req_state.set_url(b"https://example.com/proxy").unwrap();

    let cancelled = CancellationToken::new();
    let timeout_guard = {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancelled.cancel();
        })
    };

    let run = async { subrequest::send_synchronous(&host, "slow", &req_state, Bytes::new(), 0, &cancelled).await };
    let outcome = tokio::select! {
        biased;
        _ = cancelled.cancelled() => Err(anyhow::anyhow!("wasm trap: interrupt (context cancelled)")),
        result = run => result.map_err(|_| anyhow::anyhow!("subrequest failed")),
    };
    timeout_guard.abort();

    let trap = outcome.unwrap_err();
    let response = trap_response(&trap);
    assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(body.contains("wasm trap: interrupt"));
}
