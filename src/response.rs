//! Component E: per-handle response state (§3, §4.E).

use http::{HeaderMap, StatusCode};

use crate::error::XqdError;
use crate::framing::FramingHeadersMode;
use crate::version::HttpVersion;

#[derive(Debug, Clone)]
pub struct ResponseState {
    pub status: StatusCode,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body: Option<u32>,
    pub framing: FramingHeadersMode,
    pub auto_decompress: u32,
}

impl Default for ResponseState {
    fn default() -> Self {
        ResponseState {
            status: StatusCode::OK,
            version: HttpVersion::Http11,
            headers: HeaderMap::new(),
            body: None,
            framing: FramingHeadersMode::Automatic,
            auto_decompress: 0,
        }
    }
}

impl ResponseState {
    pub fn set_status(&mut self, code: u16) -> Result<(), XqdError> {
        self.status =
            StatusCode::from_u16(code).map_err(|_| XqdError::HttpParse("invalid status".into()))?;
        Ok(())
    }
}
