//! Host binding for the plughost wasm plugin runtime.
//!
//! Build a [`Manifest`], register host [`Function`]s, and load a [`Plugin`]:
//!
//! ```no_run
//! use plughost::{Function, Manifest, Plugin, Wasm};
//!
//! let double = Function::typed("double", |x: i64| x * 2)?;
//! let manifest = Manifest::new([Wasm::file("plugin.wasm")]);
//! let mut plugin = Plugin::new(&manifest, [double], true)?;
//! let output = plugin.call("run", b"input")?;
//! # Ok::<(), plughost::Error>(())
//! ```
//!
//! All native access goes through the C ABI of `plughost-sys`.

mod cancel;
mod compiled;
mod current_plugin;
mod error;
mod function;
pub mod memory;
mod plugin;
pub mod val;

pub use cancel::{CancelGuard, CancelHandle, CancelSignal};
pub use compiled::CompiledPlugin;
pub use current_plugin::CurrentPlugin;
pub use error::{Error, Result};
pub use function::{Function, HostReturn, TypedHostFn, UserData};
pub use plugin::{Plugin, PluginOptions};
pub use val::{PTR, Val, ValType, ValueKind, decode_tag, read_typed, tag_of, write_typed};

pub use plughost_manifest::{
    self as manifest, HttpMethod, HttpRequest, Manifest, ManifestError, MemoryOptions, Wasm,
    WasmMetadata, sha256_hex,
};

use std::ffi::{CStr, CString};

/// Installs the runtime's log subscriber. `target` is `stdout`, `stderr`, or
/// a file path; `filter` takes `tracing` filter directives such as `info`.
pub fn set_log_file(target: &str, filter: &str) -> Result<()> {
    let target_c = CString::new(target)?;
    let filter_c = CString::new(filter)?;
    if unsafe { plughost_sys::plughost_log_file(target_c.as_ptr(), filter_c.as_ptr()) } {
        Ok(())
    } else {
        Err(Error::Logging(format!("unable to log to {target} with filter '{filter}'")))
    }
}

/// Version of the linked runtime.
pub fn sys_version() -> String {
    unsafe { CStr::from_ptr(plughost_sys::plughost_version()) }
        .to_string_lossy()
        .into_owned()
}
