//! Turns the bytes handed to the runtime into compiled modules.
//!
//! Accepted inputs are a raw wasm binary, wasm text, or a JSON manifest.

use crate::error::Error;
use plughost_manifest::{HttpRequest, Manifest, Wasm};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wasmtime::{Engine, Module};

const WASM_MAGIC: &[u8] = b"\0asm";

/// Runtime limits and configuration derived from the manifest.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadOptions {
    pub(crate) config: BTreeMap<String, String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_pages: Option<u32>,
    pub(crate) max_var_bytes: Option<u64>,
}

pub(crate) struct Sources {
    /// Named modules; dependencies are linked under their names.
    pub(crate) modules: Vec<(String, Module)>,
    /// Index of the module providing the callable exports.
    pub(crate) main: usize,
    pub(crate) options: LoadOptions,
}

fn is_manifest(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

pub(crate) fn load(engine: &Engine, bytes: &[u8]) -> Result<Sources, Error> {
    if bytes.starts_with(WASM_MAGIC) || !is_manifest(bytes) {
        debug!(size_bytes = bytes.len(), "Loading bare module");
        let module = compile(engine, "main", bytes)?;
        return Ok(Sources {
            modules: vec![("main".to_string(), module)],
            main: 0,
            options: LoadOptions::default(),
        });
    }

    let manifest = Manifest::from_json(bytes)?;
    manifest.validate()?;
    load_manifest(engine, &manifest)
}

fn load_manifest(engine: &Engine, manifest: &Manifest) -> Result<Sources, Error> {
    if manifest.allowed_hosts.is_some() || manifest.allowed_paths.is_some() {
        debug!(
            allowed_hosts = ?manifest.allowed_hosts,
            allowed_paths = ?manifest.allowed_paths,
            "Access lists recorded; enforcement is left to the host"
        );
    }

    let explicit_main = manifest
        .wasm
        .iter()
        .any(|w| w.meta().name.as_deref() == Some("main"));
    let last = manifest.wasm.len() - 1;

    let mut modules = Vec::with_capacity(manifest.wasm.len());
    for (i, wasm) in manifest.wasm.iter().enumerate() {
        let name = match &wasm.meta().name {
            Some(name) => name.clone(),
            None if i == last && !explicit_main => "main".to_string(),
            None => format!("wasm{i}"),
        };
        let bytes = fetch(&name, wasm)?;
        wasm.meta().verify(&bytes)?;
        let module = compile(engine, &name, &bytes)?;
        modules.push((name, module));
    }

    let main = modules
        .iter()
        .position(|(name, _)| name == "main")
        .unwrap_or(last);

    Ok(Sources {
        modules,
        main,
        options: LoadOptions {
            config: manifest.config.clone(),
            timeout: manifest.timeout(),
            max_pages: manifest.memory.max_pages,
            max_var_bytes: manifest.memory.max_var_bytes,
        },
    })
}

fn fetch(name: &str, wasm: &Wasm) -> Result<Vec<u8>, Error> {
    match wasm {
        Wasm::Data { data, .. } => Ok(data.clone()),
        Wasm::File { path, .. } => std::fs::read(path).map_err(|e| Error::Source {
            source_name: name.to_string(),
            reason: format!("failed to read {}: {e}", path.display()),
        }),
        Wasm::Url { req, .. } => fetch_url(name, req),
    }
}

/// Downloads a url source. Uses a blocking client, so it must not be called
/// from inside an async runtime's worker thread.
fn fetch_url(name: &str, req: &HttpRequest) -> Result<Vec<u8>, Error> {
    let method_name = req.method.unwrap_or_default().as_str();
    let method = reqwest::Method::from_bytes(method_name.as_bytes()).map_err(|e| Error::Source {
        source_name: name.to_string(),
        reason: format!("invalid method {method_name}: {e}"),
    })?;
    info!(url = %req.url, method = method_name, "Fetching wasm source");

    let client = reqwest::blocking::Client::new();
    let mut request = client.request(method, &req.url);
    for (key, value) in &req.headers {
        request = request.header(key, value);
    }
    let response = request.send()?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}

fn compile(engine: &Engine, name: &str, bytes: &[u8]) -> Result<Module, Error> {
    info!(module = name, size_bytes = bytes.len(), "Compiling wasm module");
    let compile_start = Instant::now();
    let module = Module::new(engine, bytes)?;
    info!(
        module = name,
        elapsed_ms = compile_start.elapsed().as_millis() as u64,
        "Compilation complete"
    );
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_detection() {
        assert!(is_manifest(b"  \n{\"wasm\": []}"));
        assert!(!is_manifest(b"(module)"));
        assert!(!is_manifest(b"\0asm\x01\0\0\0"));
        assert!(!is_manifest(b""));
    }
}
