//! Error types for the binding.

use plughost_manifest::ManifestError;
use plughost_sys::ValType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Load(String),

    /// The guest trapped, reported an error, or returned a non-zero code.
    #[error("plugin call failed (code {code}): {message}")]
    Execution { message: String, code: i32 },

    #[error("plugin call cancelled")]
    Cancelled,

    #[error("plugin has been disposed")]
    Disposed,

    #[error("unsupported value type tag: {0}")]
    UnsupportedType(u32),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: ValType, actual: ValType },

    #[error("unable to allocate {len} bytes in plugin memory")]
    Allocation { len: u64 },

    #[error("destination too small: {len} bytes do not fit a block of {capacity}")]
    DestinationTooSmall { len: u64, capacity: u64 },

    #[error("manifest encoding failed: {0}")]
    Encoding(#[from] ManifestError),

    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("{0}")]
    Host(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    /// Convenience for host functions that fail with a message.
    pub fn host(message: impl Into<String>) -> Self {
        Error::Host(message.into())
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(e: std::ffi::NulError) -> Self {
        Error::InvalidString(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
