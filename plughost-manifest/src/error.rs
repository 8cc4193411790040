//! Error types for manifest handling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("toml encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error("hash mismatch for wasm '{name}': expected {expected}, found {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported manifest format: {0}")]
    UnsupportedFormat(String),
}
