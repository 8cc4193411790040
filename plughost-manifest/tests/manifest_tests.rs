//! Wire-format tests for the manifest encoder.

use plughost_manifest::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;

fn encoded(manifest: &Manifest) -> Value {
    serde_json::from_slice(&manifest.encode().unwrap()).unwrap()
}

// ================================================================
// JSON schema
// ================================================================

#[test]
fn full_manifest_uses_documented_keys() {
    let manifest = Manifest::new([Wasm::data(vec![1u8, 2, 3]).with_name("main")])
        .with_memory_max_pages(4)
        .with_memory_max_http_response_bytes(1024)
        .with_memory_max_var_bytes(512)
        .with_allowed_host("*.example.com")
        .with_allowed_path("/tmp/host", "/data")
        .with_config_key("greeting", "hi")
        .with_timeout(Duration::from_secs(2));

    assert_eq!(
        encoded(&manifest),
        json!({
            "wasm": [{ "data": "AQID", "name": "main" }],
            "memory": {
                "max_pages": 4,
                "max_http_response_bytes": 1024,
                "max_var_bytes": 512
            },
            "allowed_hosts": ["*.example.com"],
            "allowed_paths": { "/tmp/host": "/data" },
            "config": { "greeting": "hi" },
            "timeout_ms": 2000
        })
    );
}

#[test]
fn minimal_manifest_omits_unset_fields() {
    let manifest = Manifest::new([Wasm::data(b"x".to_vec())]);
    assert_eq!(
        encoded(&manifest),
        json!({ "wasm": [{ "data": "eA==" }], "memory": {} })
    );
}

#[test]
fn url_source_serializes_method_by_name() {
    let manifest = Manifest::new([Wasm::url("https://cdn.example.com/p.wasm")
        .with_header("Authorization", "Bearer t")
        .with_method(HttpMethod::Post)
        .with_hash("abcd")]);

    assert_eq!(
        encoded(&manifest)["wasm"][0],
        json!({
            "url": "https://cdn.example.com/p.wasm",
            "header": { "Authorization": "Bearer t" },
            "method": "POST",
            "hash": "abcd"
        })
    );
}

#[test]
fn relative_file_path_encoded_as_absolute() {
    let manifest = Manifest::new([Wasm::file("plugins/count.wasm")]);
    let json = encoded(&manifest);
    let path = json["wasm"][0]["path"].as_str().unwrap();
    assert!(std::path::Path::new(path).is_absolute());
    assert!(path.ends_with("count.wasm"));
    // the in-memory manifest is left untouched
    assert_eq!(manifest.wasm[0], Wasm::file("plugins/count.wasm"));
}

#[test]
fn encoded_manifest_parses_back() {
    let manifest = Manifest::new([
        Wasm::data(vec![0u8, 97, 115, 109]).with_name("lib"),
        Wasm::url("https://x.test/main.wasm").with_method(HttpMethod::Get),
    ])
    .with_timeout(Duration::from_millis(50));

    let parsed = Manifest::from_json(&manifest.encode().unwrap()).unwrap();
    assert_eq!(parsed, manifest);
}

#[test]
fn toml_output_parses_back() {
    let manifest = Manifest::new([
        Wasm::data(vec![0u8, 97, 115, 109]).with_name("lib"),
        Wasm::url("https://x.test/main.wasm")
            .with_header("Authorization", "Bearer t")
            .with_method(HttpMethod::Post)
            .with_hash("abcd")
            .with_name("main"),
    ])
    .with_memory_max_pages(4)
    .with_memory_max_var_bytes(512)
    .with_allowed_host("*.example.com")
    .with_allowed_path("/tmp/host", "/data")
    .with_config_key("greeting", "hi")
    .with_timeout(Duration::from_secs(2));

    let text = manifest.to_toml().unwrap();
    assert_eq!(Manifest::from_toml(&text).unwrap(), manifest);
}

// ================================================================
// File loading
// ================================================================

#[test]
fn loads_toml_manifest_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin.toml");
    std::fs::write(
        &path,
        r#"
timeout_ms = 250

[[wasm]]
path = "/opt/plugins/count.wasm"
name = "main"

[memory]
max_pages = 16

[config]
mode = "strict"
"#,
    )
    .unwrap();

    let manifest = Manifest::from_path(&path).unwrap();
    assert_eq!(manifest.timeout(), Some(Duration::from_millis(250)));
    assert_eq!(manifest.memory.max_pages, Some(16));
    assert_eq!(manifest.config.get("mode").map(String::as_str), Some("strict"));
    assert_eq!(
        manifest.wasm,
        vec![Wasm::file("/opt/plugins/count.wasm").with_name("main")]
    );
}

#[test]
fn loads_json_manifest_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin.json");
    std::fs::write(&path, r#"{"wasm":[{"url":"https://a.test/p.wasm"}]}"#).unwrap();

    let manifest = Manifest::from_path(&path).unwrap();
    assert_eq!(manifest.wasm, vec![Wasm::url("https://a.test/p.wasm")]);
}

#[test]
fn unknown_extension_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin.yaml");
    std::fs::write(&path, "wasm: []").unwrap();

    let err = Manifest::from_path(&path).unwrap_err();
    assert!(matches!(err, ManifestError::UnsupportedFormat(ext) if ext == "yaml"));
}

#[test]
fn invalid_base64_data_rejected() {
    let err = Manifest::from_json(br#"{"wasm":[{"data":"***"}]}"#).unwrap_err();
    assert!(matches!(err, ManifestError::Json(_)));
}
