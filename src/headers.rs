//! Canonicalized header map helpers shared by `RequestState` and
//! `ResponseState` (§4.E).
//!
//! Grounded on other_examples softprops-fasttime's `fastly_http_req` /
//! `fastly_http_resp`, which use `hyper::HeaderMap` plus
//! `names.sort_unstable()` before emitting through the cursor protocol.
//! We use `http::HeaderMap` (the crate `hyper`/`axum` both re-export),
//! which already canonicalizes names to lowercase on insert.

use crate::error::XqdError;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Maximum header name length the ABI will accept (§4.E: "Header
/// names >65535 bytes -> InvalidArgument").
pub const MAX_HEADER_NAME_LEN: usize = 65535;

pub fn canonicalize_name(raw: &[u8]) -> Result<HeaderName, XqdError> {
    if raw.len() > MAX_HEADER_NAME_LEN {
        return Err(XqdError::InvalidArgument(
            "header name too long".to_string(),
        ));
    }
    HeaderName::from_bytes(raw)
        .map_err(|_| XqdError::HttpParse(format!("invalid header name {:?}", String::from_utf8_lossy(raw))))
}

pub fn parse_value(raw: &[u8]) -> Result<HeaderValue, XqdError> {
    HeaderValue::from_bytes(raw)
        .map_err(|_| XqdError::HttpParse(format!("invalid header value {:?}", String::from_utf8_lossy(raw))))
}

/// Alphabetically sorted, de-duplicated header names (§4.E:
/// "output order for `names_get` is alphabetical").
pub fn sorted_names(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers
        .keys()
        .map(|n| n.as_str().to_string())
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// All values for `name`, in insertion order (§5: "same-name append
/// preserves insertion order").
pub fn all_values(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect()
}

/// `header_insert`: replace any existing values for `name` with `value`
/// (§4.E, §8: "Idempotence: `header_insert(n,v); header_insert(n,v)`
/// results in exactly one value v").
pub fn insert(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    headers.insert(name, value);
}

/// `header_append`: add `value` without disturbing existing values.
pub fn append(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    headers.append(name, value);
}

/// `header_remove`: §9 picks `InvalidArgument` for a missing header,
/// over the alternative (treat as a no-op success) that some guest SDKs
/// expect.
pub fn remove(headers: &mut HeaderMap, name: &HeaderName) -> Result<(), XqdError> {
    if headers.remove(name).is_none() {
        return Err(XqdError::InvalidArgument(format!(
            "no such header: {}",
            name
        )));
    }
    Ok(())
}

/// `header_values_set`: replace all values for `name` with the NUL-split
/// list parsed from `raw`.
pub fn set_values(headers: &mut HeaderMap, name: HeaderName, raw: &[u8]) -> Result<(), XqdError> {
    headers.remove(&name);
    for chunk in raw.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }
        let value = parse_value(chunk)?;
        headers.append(name.clone(), value);
    }
    Ok(())
}
