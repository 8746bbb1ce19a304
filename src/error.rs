use crate::status::XqdStatus;

/// Every error an ABI entry point can produce internally, before it is
/// translated into a status code for the guest (§7).
#[derive(Debug, thiserror::Error)]
pub enum XqdError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer too small, need {needed} bytes")]
    BufferLength { needed: u32 },

    #[error("unsupported ABI call")]
    Unsupported,

    #[error("http parse error: {0}")]
    HttpParse(String),

    #[error("request is not usable: {0}")]
    HttpUserInvalid(String),

    #[error("memory access out of bounds")]
    Memory,

    #[error("internal error: {0}")]
    Internal(String),
}

impl XqdError {
    /// Maps this error onto the guest-visible status catalog (§7).
    pub fn status(&self) -> XqdStatus {
        match self {
            XqdError::InvalidHandle => XqdStatus::INVALID_HANDLE,
            XqdError::InvalidArgument(_) => XqdStatus::INVALID_ARGUMENT,
            XqdError::BufferLength { .. } => XqdStatus::BUFFER_LENGTH,
            XqdError::Unsupported => XqdStatus::UNSUPPORTED,
            XqdError::HttpParse(_) => XqdStatus::HTTP_PARSE,
            XqdError::HttpUserInvalid(_) => XqdStatus::HTTP_USER_INVALID,
            XqdError::Memory | XqdError::Internal(_) => XqdStatus::ERROR,
        }
    }
}

pub type XqdResult<T> = Result<T, XqdError>;
