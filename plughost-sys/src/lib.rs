//! Wasmtime-based plugin runtime for plughost.
//!
//! Loads wasm modules (bare or described by a JSON manifest), links the
//! guest kernel imports and host functions, and runs exports under fuel and
//! wall-clock limits. The runtime is consumed through the C ABI in [`ffi`];
//! the Rust types are exported so the ABI's opaque handles have names.
//!
//! Each plugin runs in its own `wasmtime::Store` with a runtime-owned kernel
//! memory for input, output and host-allocated blocks.

mod compiled;
mod current_plugin;
mod engine;
mod error;
pub mod ffi;
mod function;
mod kernel;
mod loader;
mod logging;
mod plugin;
mod state;
mod types;

pub use compiled::CompiledPlugin;
pub use current_plugin::CurrentPlugin;
pub use engine::EPOCH_TICK_INTERVAL;
pub use error::Error;
pub use ffi::*;
pub use function::{FreeUserData, Function, FunctionCallback};
pub use logging::set_log_file;
pub use plugin::{CALL_FAILED, Plugin};
pub use state::{CancelHandle, PAGE_SIZE};
pub use types::{PTR, Size, Val, ValType, ValUnion};
