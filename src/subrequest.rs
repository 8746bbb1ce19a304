//! Component G: the subrequest engine -- synchronous, asynchronous and
//! streaming sends; pending-request futures; poll/wait/select-first
//! (§4.G, §5).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Request};

use crate::backend::BackendRegistry;
use crate::capabilities::GeoLookup;
use crate::error::XqdError;
use crate::framing::{auto_decompress, FramingHeadersMode};
use crate::instance::Host;
use crate::oneshot::OneShot;
use crate::request::RequestState;

/// How long a synchronous send's ctx-cancel race gives the in-flight task
/// to finish before giving up on it (§4.G: "allow 10 ms best-effort
/// for the task to finish").
const CTX_CANCEL_GRACE: Duration = Duration::from_millis(10);

/// `cdn-loop` header added to every outgoing subrequest (§4.B "a
/// subrequest always adds header `cdn-loop: fastlike`").
const CDN_LOOP_HEADER: &str = "cdn-loop";
const CDN_LOOP_VALUE: &str = "fastlike";

/// Special backend name that always routes through `host.geo` instead of
/// the backend registry (§4.F: "The special name `\"geolocation\"`
/// always routes through the geolocation handler, not the registry").
const GEOLOCATION_BACKEND: &str = "geolocation";

/// One classified outcome of a subrequest send (§6 `SendErrorDetail`,
/// §4.G "classification is string/type-based").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorTag {
    Ok,
    DnsTimeout,
    DnsError,
    DestinationNotFound,
    DestinationIpUnroutable,
    ConnectionRefused,
    ConnectionTerminated,
    ConnectionTimeout,
    TlsCertificateError,
    TlsProtocolError,
    InternalError,
}

impl SendErrorTag {
    pub fn as_u32(self) -> u32 {
        match self {
            SendErrorTag::Ok => 0,
            SendErrorTag::DnsTimeout => 1,
            SendErrorTag::DnsError => 2,
            SendErrorTag::DestinationNotFound => 3,
            SendErrorTag::DestinationIpUnroutable => 4,
            SendErrorTag::ConnectionRefused => 5,
            SendErrorTag::ConnectionTerminated => 6,
            SendErrorTag::ConnectionTimeout => 7,
            SendErrorTag::TlsCertificateError => 8,
            SendErrorTag::TlsProtocolError => 9,
            SendErrorTag::InternalError => 10,
        }
    }
}

/// Classifies a `reqwest::Error` into the tag catalog (§4.G). String
/// matching on the error's `Display` output stands in for inspecting
/// `hyper`/`rustls` internals directly, using a string/type-based
/// classification.
pub fn classify_transport_error(e: &reqwest::Error) -> SendErrorTag {
    let text = e.to_string().to_ascii_lowercase();

    if e.is_timeout() {
        if text.contains("dns") {
            return SendErrorTag::DnsTimeout;
        }
        return SendErrorTag::ConnectionTimeout;
    }
    if e.is_connect() {
        if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
            return SendErrorTag::DnsError;
        }
        if text.contains("refused") {
            return SendErrorTag::ConnectionRefused;
        }
        if text.contains("unreachable") {
            return SendErrorTag::DestinationIpUnroutable;
        }
        if text.contains("not found") || text.contains("no route") {
            return SendErrorTag::DestinationNotFound;
        }
        return SendErrorTag::ConnectionRefused;
    }
    if text.contains("certificate") || text.contains("cert verify") {
        return SendErrorTag::TlsCertificateError;
    }
    if text.contains("tls") || text.contains("ssl") || text.contains("handshake") {
        return SendErrorTag::TlsProtocolError;
    }
    if text.contains("reset") || text.contains("broken pipe") || text.contains("connection closed") {
        return SendErrorTag::ConnectionTerminated;
    }
    if text.contains("deadline exceeded") || text.contains("timed out") {
        return SendErrorTag::ConnectionTimeout;
    }
    SendErrorTag::InternalError
}

/// Bit positions within the `SendErrorDetail.mask` field (§6): which
/// of the optional DNS/TLS fields are populated.
pub mod error_detail_mask {
    pub const DNS_ERROR_RCODE: u32 = 1 << 0;
    pub const DNS_ERROR_INFO_CODE: u32 = 1 << 1;
    pub const TLS_ALERT_ID: u32 = 1 << 2;
}

/// The 16-byte `SendErrorDetail` struct (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SendErrorDetail {
    pub tag: u32,
    pub mask: u32,
    pub dns_error_rcode: u16,
    pub dns_error_info_code: u16,
    pub tls_alert_id: u8,
}

impl SendErrorDetail {
    pub fn ok() -> Self {
        SendErrorDetail {
            tag: SendErrorTag::Ok.as_u32(),
            ..Default::default()
        }
    }

    pub fn from_tag(tag: SendErrorTag) -> Self {
        SendErrorDetail {
            tag: tag.as_u32(),
            ..Default::default()
        }
    }

    /// Writes the bit-exact little-endian layout at `ptr` (§6: "16
    /// bytes, little-endian, 4-byte aligned").
    pub fn write_to(&self, memory: &mut dyn crate::memory::MemoryView, ptr: u32) -> Result<(), XqdError> {
        memory.write_u32(ptr, self.tag).map_err(|_| XqdError::Memory)?;
        memory.write_u32(ptr + 4, self.mask).map_err(|_| XqdError::Memory)?;
        memory
            .write_u16(ptr + 8, self.dns_error_rcode)
            .map_err(|_| XqdError::Memory)?;
        memory
            .write_u16(ptr + 10, self.dns_error_info_code)
            .map_err(|_| XqdError::Memory)?;
        memory
            .write_u8(ptr + 12, self.tls_alert_id)
            .map_err(|_| XqdError::Memory)?;
        Ok(())
    }
}

/// The outcome of one subrequest send: either a response ready to be
/// installed into fresh response/body handles, or a classified failure
/// (§4.G, §3 "PendingRequest").
#[derive(Clone)]
pub enum SendOutcome {
    Response(Arc<http::Response<Bytes>>),
    Failed(SendErrorTag),
}

/// A single in-flight (or completed) asynchronous subrequest (§3).
pub struct PendingRequest {
    result: OneShot<SendOutcome>,
}

impl Default for PendingRequest {
    fn default() -> Self {
        PendingRequest {
            result: OneShot::new(),
        }
    }
}

impl PendingRequest {
    pub fn complete(&self, outcome: SendOutcome) {
        self.result.complete(outcome);
    }

    pub fn is_ready(&self) -> bool {
        self.result.is_ready()
    }

    /// Non-blocking read for `pending_req_poll` (§4.G: "non-blocking").
    pub fn try_get(&self) -> Option<SendOutcome> {
        self.result.try_get()
    }

    pub async fn wait(&self) -> SendOutcome {
        self.result.wait().await
    }
}

/// Applies the framing-mode policy to an outgoing request builder
/// (§4.G "Framing mode"). `Automatic` lets the HTTP client derive
/// Content-Length from the body; `ManuallyFromHeaders` trusts whatever
/// the guest already set and only mirrors it verbatim.
pub fn apply_framing(headers: &mut http::HeaderMap, mode: FramingHeadersMode, body_len: Option<u64>) {
    match mode {
        FramingHeadersMode::Automatic => {
            headers.remove(http::header::TRANSFER_ENCODING);
            if let Some(len) = body_len {
                if !headers.contains_key(http::header::CONTENT_LENGTH) {
                    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
                        headers.insert(http::header::CONTENT_LENGTH, value);
                    }
                }
            }
        }
        FramingHeadersMode::ManuallyFromHeaders => {
            // Preserve exactly what the guest set; nothing to synthesize.
        }
    }
}

/// Decompresses a gzip response body in place if auto-decompression is
/// requested and the response is actually gzip-encoded (§4.G "Auto-
/// decompression"). A malformed stream falls back to stripping the
/// encoding headers and returning the raw bytes unchanged.
pub fn apply_auto_decompress(mask: u32, headers: &mut http::HeaderMap, body: Bytes) -> Bytes {
    if !auto_decompress::gzip_enabled(mask) {
        return body;
    }
    let is_gzip = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
        .unwrap_or(false);
    if !is_gzip {
        return body;
    }

    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(&body[..]);
    let mut decompressed = Vec::new();
    let result = decoder.read_to_end(&mut decompressed);

    headers.remove(http::header::CONTENT_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);

    match result {
        Ok(_) => Bytes::from(decompressed),
        Err(_) => body,
    }
}

/// Builds the outgoing `reqwest` request for a subrequest: clones
/// headers, injects `cdn-loop`, and applies framing (§4.G steps
/// 2-5).
pub fn build_outgoing_request(
    req: &RequestState,
    body: Bytes,
) -> Result<Request<reqwest::Body>, XqdError> {
    let url = req
        .url
        .as_ref()
        .ok_or_else(|| XqdError::HttpUserInvalid("request has no url".to_string()))?;

    let mut headers = req.headers.clone();
    headers.insert(
        http::HeaderName::from_static(CDN_LOOP_HEADER),
        HeaderValue::from_static(CDN_LOOP_VALUE),
    );
    apply_framing(&mut headers, req.framing, Some(body.len() as u64));

    let mut builder = Request::builder().method(req.method.clone()).uri(url.as_str());
    *builder.headers_mut().expect("builder is fresh") = headers;
    builder
        .body(reqwest::Body::from(body))
        .map_err(|e| XqdError::Internal(e.to_string()))
}

/// Builds a synthetic response for the `"geolocation"` backend by
/// looking up `host.geo` directly instead of dispatching through the
/// registry (§4.F). The address to look up is the request URL's last
/// path segment, e.g. a guest sending to
/// `http://geolocation/203.0.113.5` looks up `203.0.113.5`; a segment
/// that doesn't parse as an IP address yields a 400.
fn geo_backend_response(host: &Host, req: &RequestState) -> http::Response<Bytes> {
    let addr = req
        .url
        .as_ref()
        .and_then(|u| u.path_segments())
        .and_then(|mut segs| segs.next_back())
        .filter(|seg| !seg.is_empty())
        .and_then(|seg| seg.parse::<std::net::IpAddr>().ok());

    let Some(addr) = addr else {
        return http::Response::builder()
            .status(http::StatusCode::BAD_REQUEST)
            .body(Bytes::from_static(b"invalid geolocation address"))
            .expect("static response is well-formed");
    };

    let record = host.geo.lookup(addr);
    let json = serde_json::to_vec(&record).unwrap_or_default();
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(json))
        .expect("static response is well-formed")
}

/// Runs one full send against the backend registry: build request,
/// invoke handler, apply auto-decompression. This is the body shared by
/// the synchronous and asynchronous code paths (§4.G steps 4-8).
pub async fn run_send(
    host: &Host,
    backend_name: &str,
    req: &RequestState,
    body: Bytes,
    auto_decompress_mask: u32,
) -> Result<http::Response<Bytes>, SendErrorTag> {
    if backend_name == GEOLOCATION_BACKEND {
        return Ok(geo_backend_response(host, req));
    }

    let outgoing = build_outgoing_request(req, body).map_err(|_| SendErrorTag::InternalError)?;
    let handler = host.backends.get(backend_name);
    let resp = handler.send(outgoing).await.map_err(|_| SendErrorTag::InternalError)?;

    let (mut parts, body) = resp.into_parts();
    let body_bytes = http_body_util::BodyExt::collect(body)
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let decompressed = apply_auto_decompress(auto_decompress_mask, &mut parts.headers, body_bytes);
    Ok(http::Response::from_parts(parts, decompressed))
}

/// Synchronous `req_send` (§4.G): races the send against a
/// cancellation token, pausing/resuming CPU accounting around the wait.
pub async fn send_synchronous(
    host: &Host,
    backend_name: &str,
    req: &RequestState,
    body: Bytes,
    auto_decompress_mask: u32,
    cancelled: &tokio_util::sync::CancellationToken,
) -> Result<http::Response<Bytes>, SendErrorTag> {
    tokio::select! {
        result = run_send(host, backend_name, req, body, auto_decompress_mask) => result,
        _ = cancelled.cancelled() => {
            // Best-effort grace period; the guest is expected to trap via
            // epoch interruption on its next instruction regardless.
            tokio::time::sleep(CTX_CANCEL_GRACE).await;
            Err(SendErrorTag::InternalError)
        }
    }
}

/// Spawns the asynchronous send as a background task that completes a
/// fresh `PendingRequest` (§4.G "asynchronous... allocate a
/// PendingRequest and spawn a task"). Takes the shared `Host` (rather than
/// just its backend registry) so the spawned task can outlive the
/// `Instance` that started it without borrowing anything from it.
pub fn send_asynchronous(
    host: Arc<Host>,
    backend_name: String,
    req: RequestState,
    body: Bytes,
    auto_decompress_mask: u32,
) -> Arc<PendingRequest> {
    let pending = Arc::new(PendingRequest::default());
    let pending_clone = pending.clone();
    tokio::spawn(async move {
        match run_send(&host, &backend_name, &req, body, auto_decompress_mask).await {
            Ok(resp) => pending_clone.complete(SendOutcome::Response(Arc::new(resp))),
            Err(tag) => pending_clone.complete(SendOutcome::Failed(tag)),
        }
    });
    pending
}

/// `pending_req_select`: returns the index of the first pending request
/// (among `handles`) to complete (§4.G, §5: "one waiter task per
/// handle, funneling readiness into a single channel"). Ties resolve to
/// the lowest index (§5).
pub async fn select_first(handles: &[Arc<PendingRequest>]) -> Result<usize, XqdError> {
    if handles.is_empty() {
        return Err(XqdError::InvalidArgument(
            "pending_req_select requires at least one handle".to_string(),
        ));
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel(handles.len());
    for (idx, handle) in handles.iter().enumerate() {
        let handle = handle.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            handle.wait().await;
            let _ = tx.send(idx).await;
        });
    }
    drop(tx);

    let mut ready: Vec<usize> = Vec::new();
    if let Some(first) = rx.recv().await {
        ready.push(first);
        // Drain any other waiters that happened to resolve immediately
        // so ties consistently favor the lowest index.
        while let Ok(more) = rx.try_recv() {
            ready.push(more);
        }
    }
    ready.sort_unstable();
    ready
        .first()
        .copied()
        .ok_or_else(|| XqdError::Internal("select produced no winner".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEntry, DefaultBackend, KeepaliveOptions, TlsOptions, Timeouts};
    use async_trait::async_trait;

    struct TeapotBackend;

    #[async_trait]
    impl crate::backend::BackendHandler for TeapotBackend {
        async fn send(
            &self,
            _req: Request<reqwest::Body>,
        ) -> Result<http::Response<reqwest::Body>, XqdError> {
            http::Response::builder()
                .status(418)
                .body(reqwest::Body::from("i am a teapot"))
                .map_err(|e| XqdError::Internal(e.to_string()))
        }
    }

    fn registry_with_teapot() -> BackendRegistry {
        let registry = BackendRegistry::new(Arc::new(DefaultBackend));
        registry.register_static(BackendEntry {
            name: "teapot".to_string(),
            target: "http://teapot.invalid".to_string(),
            host_override: None,
            tls: TlsOptions::default(),
            timeouts: Timeouts::default(),
            keepalive: KeepaliveOptions::default(),
            dynamic: false,
            handler: Arc::new(TeapotBackend),
        });
        registry
    }

    fn test_host() -> Arc<Host> {
        Arc::new(Host {
            backends: registry_with_teapot(),
            geo: Arc::new(crate::capabilities::NullGeoLookup),
            dictionaries: crate::capabilities::Dictionaries::default(),
            loggers: crate::capabilities::LogEndpoints::default(),
            user_agent: None,
            kv_stores: crate::kv::KvStoreRegistry::new(),
            compliance_region: "none".to_string(),
            fastly_keys: Default::default(),
        })
    }

    #[tokio::test]
    async fn synchronous_send_reaches_registered_backend() {
        let host = test_host();
        let mut req = RequestState::default();
        req.set_url(b"https://example.com/").unwrap();
        let cancelled = tokio_util::sync::CancellationToken::new();
        let resp = send_synchronous(&host, "teapot", &req, Bytes::new(), 0, &cancelled)
            .await
            .unwrap();
        assert_eq!(resp.status(), 418);
        assert_eq!(resp.body(), &Bytes::from_static(b"i am a teapot"));
    }

    #[tokio::test]
    async fn send_without_url_is_user_invalid() {
        let req = RequestState::default();
        let err = build_outgoing_request(&req, Bytes::new()).unwrap_err();
        assert!(matches!(err, XqdError::HttpUserInvalid(_)));
    }

    #[tokio::test]
    async fn synchronous_send_routes_geolocation_through_geo_handler() {
        struct FixedGeo;
        impl crate::capabilities::GeoLookup for FixedGeo {
            fn lookup(&self, _addr: std::net::IpAddr) -> crate::capabilities::GeoRecord {
                crate::capabilities::GeoRecord {
                    country_code: Some("US".to_string()),
                    ..Default::default()
                }
            }
        }
        let host = Host {
            backends: registry_with_teapot(),
            geo: Arc::new(FixedGeo),
            dictionaries: crate::capabilities::Dictionaries::default(),
            loggers: crate::capabilities::LogEndpoints::default(),
            user_agent: None,
            kv_stores: crate::kv::KvStoreRegistry::new(),
            compliance_region: "none".to_string(),
            fastly_keys: Default::default(),
        };
        let mut req = RequestState::default();
        req.set_url(b"http://geolocation/203.0.113.5").unwrap();
        let cancelled = tokio_util::sync::CancellationToken::new();
        let resp = send_synchronous(&host, "geolocation", &req, Bytes::new(), 0, &cancelled)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let record: crate::capabilities::GeoRecord = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(record.country_code.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn asynchronous_send_completes_pending_request() {
        let host = test_host();
        let mut req = RequestState::default();
        req.set_url(b"https://example.com/").unwrap();
        let pending = send_asynchronous(host, "teapot".to_string(), req, Bytes::new(), 0);
        match pending.wait().await {
            SendOutcome::Response(resp) => assert_eq!(resp.status(), 418),
            SendOutcome::Failed(tag) => panic!("unexpected failure: {tag:?}"),
        }
        assert!(pending.is_ready());
    }

    #[tokio::test]
    async fn select_first_returns_lowest_ready_index() {
        let a = Arc::new(PendingRequest::default());
        let b = Arc::new(PendingRequest::default());
        b.complete(SendOutcome::Failed(SendErrorTag::InternalError));
        let winner = select_first(&[a, b]).await.unwrap();
        assert_eq!(winner, 1);
    }

    #[tokio::test]
    async fn select_first_rejects_empty_list() {
        let err = select_first(&[]).await.unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[test]
    fn automatic_framing_sets_content_length_when_absent() {
        let mut headers = http::HeaderMap::new();
        apply_framing(&mut headers, FramingHeadersMode::Automatic, Some(13));
        assert_eq!(headers.get(http::header::CONTENT_LENGTH).unwrap(), "13");
    }

    #[test]
    fn manual_framing_leaves_headers_untouched() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        apply_framing(&mut headers, FramingHeadersMode::ManuallyFromHeaders, Some(13));
        assert!(headers.contains_key(http::header::TRANSFER_ENCODING));
        assert!(!headers.contains_key(http::header::CONTENT_LENGTH));
    }

    #[test]
    fn malformed_gzip_falls_back_to_raw_bytes() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let raw = Bytes::from_static(b"not actually gzip");
        let out = apply_auto_decompress(auto_decompress::GZIP, &mut headers, raw.clone());
        assert_eq!(out, raw);
        assert!(!headers.contains_key(http::header::CONTENT_ENCODING));
    }
}
