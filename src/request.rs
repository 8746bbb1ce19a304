//! Component E: per-handle request state (§3, §4.E).

use http::{HeaderMap, Method};
use url::Url;

use crate::error::XqdError;
use crate::framing::FramingHeadersMode;
use crate::version::HttpVersion;

/// The nine canonical HTTP methods a guest may set (§4.E).
const CANONICAL_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Clone, Default)]
pub struct CacheOverride {
    pub tag: u32,
    pub ttl: u32,
    pub stale_while_revalidate: u32,
    pub surrogate_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestState {
    pub method: Method,
    pub url: Option<Url>,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body: Option<u32>,
    pub framing: FramingHeadersMode,
    pub auto_decompress: u32,
    pub close_on_completion: bool,
    pub cache_override: Option<CacheOverride>,
}

impl Default for RequestState {
    fn default() -> Self {
        RequestState {
            method: Method::GET,
            url: None,
            version: HttpVersion::Http11,
            headers: HeaderMap::new(),
            body: None,
            framing: FramingHeadersMode::Automatic,
            auto_decompress: 0,
            close_on_completion: false,
            cache_override: None,
        }
    }
}

impl RequestState {
    /// `req_method_set`: validated, case-insensitive, stored upper-case
    /// (§4.E, §8: "method_set(m); method_get() returns uppercase(m)
    /// for m in the nine canonical methods; HttpParse for others").
    pub fn set_method(&mut self, raw: &[u8]) -> Result<(), XqdError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| XqdError::HttpParse("method is not valid utf-8".to_string()))?;
        let upper = text.to_ascii_uppercase();
        if !CANONICAL_METHODS.contains(&upper.as_str()) {
            return Err(XqdError::HttpParse(format!("unsupported method {text}")));
        }
        self.method = Method::from_bytes(upper.as_bytes()).expect("validated above");
        Ok(())
    }

    /// `req_uri_set`: §9 picks `HttpParse` over `XqdError` for a
    /// parse failure.
    pub fn set_url(&mut self, raw: &[u8]) -> Result<(), XqdError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| XqdError::HttpParse("uri is not valid utf-8".to_string()))?;
        let url = Url::parse(text).map_err(|e| XqdError::HttpParse(e.to_string()))?;
        self.url = Some(url);
        Ok(())
    }

    pub fn url_string(&self) -> String {
        self.url.as_ref().map(Url::to_string).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips_uppercase() {
        let mut r = RequestState::default();
        r.set_method(b"post").unwrap();
        assert_eq!(r.method, Method::POST);
    }

    #[test]
    fn unknown_method_is_http_parse() {
        let mut r = RequestState::default();
        assert!(matches!(r.set_method(b"FROB"), Err(XqdError::HttpParse(_))));
    }

    #[test]
    fn uri_round_trips_canonical_form() {
        let mut r = RequestState::default();
        r.set_url(b"https://example.com/a?b=c").unwrap();
        assert_eq!(r.url_string(), "https://example.com/a?b=c");
    }
}
