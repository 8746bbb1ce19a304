//! HTTP version codes (§6).

use crate::error::XqdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http09,
    Http10,
    Http11,
    Http2,
    Http3,
}

impl HttpVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            HttpVersion::Http09 => 0,
            HttpVersion::Http10 => 1,
            HttpVersion::Http11 => 2,
            HttpVersion::Http2 => 3,
            HttpVersion::Http3 => 4,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HttpVersion::Http09),
            1 => Some(HttpVersion::Http10),
            2 => Some(HttpVersion::Http11),
            3 => Some(HttpVersion::Http2),
            4 => Some(HttpVersion::Http3),
            _ => None,
        }
    }

    /// `version_set` accepts only HTTP/0.9, HTTP/1.0, HTTP/1.1, rejecting
    /// HTTP/2 and HTTP/3 with `InvalidArgument` (§4.E, §9: this
    /// picks `InvalidArgument` over the `Unsupported` some early ABI
    /// variants used).
    pub fn from_settable_u32(v: u32) -> Result<Self, XqdError> {
        match Self::from_u32(v) {
            Some(ver @ (HttpVersion::Http09 | HttpVersion::Http10 | HttpVersion::Http11)) => {
                Ok(ver)
            }
            Some(_) => Err(XqdError::InvalidArgument(
                "HTTP/2 and HTTP/3 cannot be set on a request or response".to_string(),
            )),
            None => Err(XqdError::InvalidArgument(format!(
                "unknown http version code {v}"
            ))),
        }
    }

    pub fn to_http(self) -> http::Version {
        match self {
            HttpVersion::Http09 => http::Version::HTTP_09,
            HttpVersion::Http10 => http::Version::HTTP_10,
            HttpVersion::Http11 => http::Version::HTTP_11,
            HttpVersion::Http2 => http::Version::HTTP_2,
            HttpVersion::Http3 => http::Version::HTTP_3,
        }
    }

    pub fn from_http(v: http::Version) -> Self {
        match v {
            http::Version::HTTP_09 => HttpVersion::Http09,
            http::Version::HTTP_10 => HttpVersion::Http10,
            http::Version::HTTP_2 => HttpVersion::Http2,
            http::Version::HTTP_3 => HttpVersion::Http3,
            _ => HttpVersion::Http11,
        }
    }
}
