//! Wasm source descriptors.

use crate::ManifestError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Returns the lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Naming and integrity information shared by every source variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmMetadata {
    /// Module name used for linking. The module named `main` (or the last
    /// module when none is) provides the callable exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expected SHA-256 of the module bytes, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl WasmMetadata {
    /// Checks `bytes` against the declared hash. Passes when no hash is set.
    pub fn verify(&self, bytes: &[u8]) -> Result<(), ManifestError> {
        let Some(expected) = &self.hash else {
            return Ok(());
        };
        let actual = sha256_hex(bytes);
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(ManifestError::HashMismatch {
                name: self.name.clone().unwrap_or_else(|| "<unnamed>".into()),
                expected: expected.clone(),
                actual,
            })
        }
    }
}

/// HTTP method used to fetch a url source. Serialized by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Remote location of a wasm module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    #[serde(
        default,
        rename = "header",
        alias = "headers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
}

/// One wasm module source: a local file, inline bytes, or a url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Wasm {
    File {
        path: PathBuf,
        #[serde(flatten)]
        meta: WasmMetadata,
    },
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(flatten)]
        meta: WasmMetadata,
    },
    Url {
        #[serde(flatten)]
        req: HttpRequest,
        #[serde(flatten)]
        meta: WasmMetadata,
    },
}

impl Wasm {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Wasm::File {
            path: path.as_ref().to_path_buf(),
            meta: WasmMetadata::default(),
        }
    }

    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Wasm::Data {
            data: data.into(),
            meta: WasmMetadata::default(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Wasm::Url {
            req: HttpRequest {
                url: url.into(),
                headers: BTreeMap::new(),
                method: None,
            },
            meta: WasmMetadata::default(),
        }
    }

    pub fn meta(&self) -> &WasmMetadata {
        match self {
            Wasm::File { meta, .. } | Wasm::Data { meta, .. } | Wasm::Url { meta, .. } => meta,
        }
    }

    fn meta_mut(&mut self) -> &mut WasmMetadata {
        match self {
            Wasm::File { meta, .. } | Wasm::Data { meta, .. } | Wasm::Url { meta, .. } => meta,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.meta_mut().name = Some(name.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.meta_mut().hash = Some(hash.into());
        self
    }

    /// Adds a request header. No-op for non-url sources.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Wasm::Url { req, .. } = &mut self {
            req.headers.insert(key.into(), value.into());
        }
        self
    }

    /// Sets the request method. No-op for non-url sources.
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        if let Wasm::Url { req, .. } = &mut self {
            req.method = Some(method);
        }
        self
    }

    /// Rewrites a relative file path into an absolute one.
    pub(crate) fn resolve_path(&mut self) -> Result<(), ManifestError> {
        if let Wasm::File { path, .. } = self {
            if !path.is_absolute() {
                *path = std::path::absolute(&*path)?;
            }
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
