//! Framing mode: who is responsible for Content-Length / Transfer-Encoding
//! on an outgoing subrequest (§4.G "Framing mode").

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingHeadersMode {
    #[default]
    Automatic,
    ManuallyFromHeaders,
}

impl FramingHeadersMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(FramingHeadersMode::Automatic),
            1 => Some(FramingHeadersMode::ManuallyFromHeaders),
            _ => None,
        }
    }
}

/// Auto-decompression bitfield; only the gzip bit is honored (§4.G).
pub mod auto_decompress {
    pub const GZIP: u32 = 1 << 0;

    pub fn gzip_enabled(mask: u32) -> bool {
        mask & GZIP != 0
    }
}
