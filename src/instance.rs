//! Per-request `Instance`: owns the handle tables (§4.B) and ties
//! them to the process-wide `Host` (backends, capabilities, KV stores).
//! One `Instance` serves exactly one downstream request and is dropped,
//! wholesale, at the end of it (§5 "Instance scope").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendRegistry;
use crate::body::BodyEntry;
use crate::capabilities::{Dictionaries, GeoLookup, LogEndpoints, UserAgentParse};
use crate::handles::Table;
use crate::kv::{KvDeleteOutcome, KvInsertOutcome, KvListOutcome, KvLookupOutcome, KvStore, KvStoreRegistry};
use crate::oneshot::OneShot;
use crate::request::RequestState;
use crate::response::ResponseState;
use crate::subrequest::PendingRequest;

/// Process-wide state shared by every `Instance` (§3 "shares...").
pub struct Host {
    pub backends: BackendRegistry,
    pub geo: Arc<dyn GeoLookup>,
    pub dictionaries: Dictionaries,
    pub loggers: LogEndpoints,
    pub user_agent: Option<Arc<dyn UserAgentParse>>,
    pub kv_stores: KvStoreRegistry,
    /// §3 (SUPPLEMENT): backing state for
    /// `xqd_req_downstream_compliance_region`.
    pub compliance_region: String,
    /// §3 (SUPPLEMENT): backing state for
    /// `xqd_req_fastly_key_is_valid`.
    pub fastly_keys: std::collections::HashSet<String>,
}

impl Host {
    pub fn fastly_key_is_valid(&self, key: &str) -> bool {
        self.fastly_keys.contains(key)
    }
}

/// Reserved handle for the downstream request/body (§4.E:
/// "`req_body_downstream_get`: returns the reserved pair (handle 0,
/// handle 0)").
pub const DOWNSTREAM_HANDLE: u32 = 0;

#[derive(Default)]
pub struct KvTables {
    pub stores: Table<Arc<dyn KvStore>>,
    pub lookups: Table<Arc<OneShot<KvLookupOutcome>>>,
    pub inserts: Table<Arc<OneShot<KvInsertOutcome>>>,
    pub deletes: Table<Arc<OneShot<KvDeleteOutcome>>>,
    pub lists: Table<Arc<OneShot<KvListOutcome>>>,
}

pub struct Instance {
    pub host: Arc<Host>,
    pub requests: Table<RequestState>,
    pub responses: Table<ResponseState>,
    pub bodies: Table<BodyEntry>,
    pub pending: Table<Arc<PendingRequest>>,
    pub kv: KvTables,
    pub cancelled: CancellationToken,
    downstream_response: Option<http::Response<Bytes>>,
    downstream_sent: bool,
    cpu_paused: Arc<AtomicBool>,
}

impl Instance {
    /// Builds a fresh instance, seating `downstream` as handle 0 in both
    /// the request and body tables (§4.L "Seat R as handle 0").
    pub fn new(host: Arc<Host>, downstream: http::Request<Bytes>, cancelled: CancellationToken) -> Self {
        let (parts, body) = downstream.into_parts();

        let mut request = RequestState {
            method: parts.method,
            headers: parts.headers,
            ..Default::default()
        };
        request.url = url::Url::parse(&parts.uri.to_string())
            .ok()
            .or_else(|| url::Url::parse(&format!("http://localhost{}", parts.uri)).ok());
        request.version = crate::version::HttpVersion::from_http(parts.version);

        let mut requests = Table::new();
        let req_handle = requests.insert(request);
        debug_assert_eq!(req_handle, DOWNSTREAM_HANDLE);

        let mut bodies = Table::new();
        let mut body_entry = BodyEntry::default();
        let _ = body_entry.append(&body);
        let body_handle = bodies.insert(body_entry);
        debug_assert_eq!(body_handle, DOWNSTREAM_HANDLE);

        Instance {
            host,
            requests,
            responses: Table::new(),
            bodies,
            pending: Table::new(),
            kv: KvTables::default(),
            cancelled,
            downstream_response: None,
            downstream_sent: false,
            cpu_paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A shared flag the driver's epoch ticker consults: while `true`, the
    /// ticker skips incrementing the epoch, so time spent in a blocking
    /// host wait (subrequest send, KV wait) does not count against the
    /// guest's CPU budget (§4.G, §9).
    pub fn cpu_pause_flag(&self) -> Arc<AtomicBool> {
        self.cpu_paused.clone()
    }

    pub fn pause_cpu(&self) {
        self.cpu_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_cpu(&self) {
        self.cpu_paused.store(false, Ordering::SeqCst);
    }

    /// `resp_send_downstream`: installs the final response. Only the
    /// first call has effect; the ABI layer surfaces subsequent calls as
    /// whatever the guest SDK expects (typically a no-op success).
    pub fn send_downstream(&mut self, response: http::Response<Bytes>) {
        if !self.downstream_sent {
            self.downstream_response = Some(response);
            self.downstream_sent = true;
        }
    }

    pub fn downstream_was_sent(&self) -> bool {
        self.downstream_sent
    }

    /// Takes whatever response the guest built, or `None` if it never
    /// called `resp_send_downstream` (§4.L: "If none, the default
    /// behavior is an empty 200").
    pub fn take_downstream_response(&mut self) -> Option<http::Response<Bytes>> {
        self.downstream_response.take()
    }

    pub fn new_response(&mut self) -> u32 {
        self.responses.insert(ResponseState::default())
    }

    pub fn new_request(&mut self) -> u32 {
        self.requests.insert(RequestState::default())
    }

    pub fn new_body(&mut self) -> u32 {
        self.bodies.insert(BodyEntry::default())
    }
}

/// Default response when the guest never called `resp_send_downstream`
/// (§4.L, §7: "empty 200").
pub fn default_empty_response() -> http::Response<Bytes> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .body(Bytes::new())
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DefaultBackend;
    use crate::capabilities::NullGeoLookup;

    fn test_host() -> Arc<Host> {
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

    fn downstream_get(uri: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .method("GET")
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn downstream_request_seats_at_handle_zero() {
        let host = test_host();
        let instance = Instance::new(host, downstream_get("/simple-response"), CancellationToken::new());
        assert_eq!(instance.requests.get(DOWNSTREAM_HANDLE).unwrap().method, http::Method::GET);
        assert!(instance.bodies.get(DOWNSTREAM_HANDLE).is_some());
    }

    #[test]
    fn send_downstream_is_first_write_wins() {
        let host = test_host();
        let mut instance = Instance::new(host, downstream_get("/x"), CancellationToken::new());
        instance.send_downstream(
            http::Response::builder().status(200).body(Bytes::from_static(b"a")).unwrap(),
        );
        instance.send_downstream(
            http::Response::builder().status(500).body(Bytes::from_static(b"b")).unwrap(),
        );
        let resp = instance.take_downstream_response().unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), &Bytes::from_static(b"a"));
    }

    #[test]
    fn missing_downstream_response_is_none() {
        let host = test_host();
        let mut instance = Instance::new(host, downstream_get("/x"), CancellationToken::new());
        assert!(instance.take_downstream_response().is_none());
    }

    #[test]
    fn pause_resume_toggles_shared_flag() {
        let host = test_host();
        let instance = Instance::new(host, downstream_get("/x"), CancellationToken::new());
        let flag = instance.cpu_pause_flag();
        assert!(!flag.load(Ordering::SeqCst));
        instance.pause_cpu();
        assert!(flag.load(Ordering::SeqCst));
        instance.resume_cpu();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
