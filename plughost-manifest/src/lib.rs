//! Plugin manifest model for plughost.
//!
//! A [`Manifest`] describes where a plugin's wasm modules come from and the
//! runtime constraints applied to it. It is the wire format handed to the
//! runtime loader: [`Manifest::encode`] produces the JSON document,
//! [`Manifest::from_json`] parses it back on the runtime side.

mod error;
mod wasm;

pub use error::ManifestError;
pub use wasm::{HttpMethod, HttpRequest, Wasm, WasmMetadata, sha256_hex};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Memory limits applied to a plugin instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Maximum number of 64 KiB pages any single linear memory may grow to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    /// Maximum size of an HTTP response body a plugin may receive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_http_response_bytes: Option<u64>,
    /// Maximum total size of the plugin's var store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_var_bytes: Option<u64>,
}

/// Structured plugin descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Wasm sources, in link order.
    #[serde(default)]
    pub wasm: Vec<Wasm>,
    #[serde(default)]
    pub memory: MemoryOptions,
    /// Hostname glob patterns the plugin may contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_hosts: Option<Vec<String>>,
    /// Host path to guest path mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<BTreeMap<PathBuf, PathBuf>>,
    /// Plugin configuration readable through `extism_config_get`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Per-call timeout in whole milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Manifest {
    pub fn new(wasm: impl IntoIterator<Item = Wasm>) -> Self {
        Self {
            wasm: wasm.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_wasm(mut self, wasm: Wasm) -> Self {
        self.wasm.push(wasm);
        self
    }

    /// Sets the call timeout. Sub-millisecond precision is truncated.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_config_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_config(
        mut self,
        config: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        for (k, v) in config {
            self.config.insert(k.into(), v.into());
        }
        self
    }

    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts
            .get_or_insert_with(Vec::new)
            .push(host.into());
        self
    }

    pub fn with_allowed_path(mut self, host: impl AsRef<Path>, guest: impl AsRef<Path>) -> Self {
        self.allowed_paths
            .get_or_insert_with(BTreeMap::new)
            .insert(host.as_ref().to_path_buf(), guest.as_ref().to_path_buf());
        self
    }

    pub fn with_memory_max_pages(mut self, pages: u32) -> Self {
        self.memory.max_pages = Some(pages);
        self
    }

    pub fn with_memory_max_http_response_bytes(mut self, bytes: u64) -> Self {
        self.memory.max_http_response_bytes = Some(bytes);
        self
    }

    pub fn with_memory_max_var_bytes(mut self, bytes: u64) -> Self {
        self.memory.max_var_bytes = Some(bytes);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Validates the manifest for required fields.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.wasm.is_empty() {
            return Err(ManifestError::Invalid(
                "at least one wasm source is required".into(),
            ));
        }
        for (i, wasm) in self.wasm.iter().enumerate() {
            if let Some(name) = &wasm.meta().name {
                if name.is_empty() {
                    return Err(ManifestError::Invalid(format!(
                        "wasm source {i} has an empty name"
                    )));
                }
            }
            if let Wasm::Url { req, .. } = wasm {
                if req.url.is_empty() {
                    return Err(ManifestError::Invalid(format!("wasm source {i} has an empty url")));
                }
            }
        }
        Ok(())
    }

    /// Serializes the manifest to the runtime's JSON wire format.
    ///
    /// Relative file paths are resolved against the current directory first,
    /// so the encoded document does not depend on the runtime's working
    /// directory.
    pub fn encode(&self) -> Result<Vec<u8>, ManifestError> {
        let mut resolved = self.clone();
        for wasm in &mut resolved.wasm {
            wasm.resolve_path()?;
        }
        Ok(serde_json::to_vec(&resolved)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_toml(text: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ManifestError> {
        Ok(toml::to_string(self)?)
    }

    /// Loads a manifest from a `.json` or `.toml` file.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let content = std::fs::read(path)?;
        match ext.as_str() {
            "json" => Self::from_json(&content),
            "toml" => {
                let text = String::from_utf8(content).map_err(|e| {
                    ManifestError::Invalid(format!("{} is not valid UTF-8: {e}", path.display()))
                })?;
                Self::from_toml(&text)
            }
            other => Err(ManifestError::UnsupportedFormat(other.to_string())),
        }
    }
}
