//! Guest-visible ABI status codes.
//!
//! Numeric values match the `fastly-shared` `FastlyStatus` catalog that
//! guest SDKs are compiled against; they must not be renumbered.

/// The i32 value returned from every ABI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XqdStatus(pub i32);

impl XqdStatus {
    pub const OK: XqdStatus = XqdStatus(0);
    pub const ERROR: XqdStatus = XqdStatus(1);
    pub const INVALID_ARGUMENT: XqdStatus = XqdStatus(2);
    pub const INVALID_HANDLE: XqdStatus = XqdStatus(3);
    pub const BUFFER_LENGTH: XqdStatus = XqdStatus(4);
    pub const UNSUPPORTED: XqdStatus = XqdStatus(5);
    pub const HTTP_PARSE: XqdStatus = XqdStatus(7);
    pub const HTTP_USER_INVALID: XqdStatus = XqdStatus(9);

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for XqdStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
