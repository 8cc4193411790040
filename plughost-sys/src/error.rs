//! Error types for the runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest error: {0}")]
    Manifest(#[from] plughost_manifest::ManifestError),

    #[error("wasm error: {0:#}")]
    Wasm(#[from] wasmtime::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unable to load wasm source '{source_name}': {reason}")]
    Source { source_name: String, reason: String },

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("invalid export '{name}': {reason}")]
    InvalidExport { name: String, reason: String },

    #[error("timeout")]
    Timeout,

    #[error("plugin call cancelled")]
    Cancelled,

    #[error("plugin ran out of fuel")]
    OutOfFuel,

    #[error("memory error: {0}")]
    Memory(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}
