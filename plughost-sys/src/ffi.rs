//! C ABI entry points.
//!
//! Handles returned here are owned by the caller and must be released with
//! the matching `*_free` function. Strings are null-terminated UTF-8.

use crate::compiled::CompiledPlugin;
use crate::current_plugin::CurrentPlugin;
use crate::error::Error;
use crate::function::{FreeUserData, Function, FunctionCallback};
use crate::plugin::{CALL_FAILED, Plugin};
use crate::state::CancelHandle;
use crate::types::{Size, ValType};
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Arc;
use tracing::{debug, error, warn};

const VERSION: &CStr =
    match CStr::from_bytes_with_nul(concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes()) {
        Ok(v) => v,
        Err(_) => c"unknown",
    };

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe fn bytes_arg<'a>(ptr: *const u8, len: Size) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }
}

unsafe fn types_arg(ptr: *const ValType, len: Size) -> Vec<ValType> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }.to_vec()
}

unsafe fn functions_arg(ptr: *const *const Function, len: Size) -> Vec<Function> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }
        .iter()
        .filter(|f| !f.is_null())
        .map(|f| unsafe { (**f).clone() })
        .collect()
}

unsafe fn set_errmsg(errmsg: *mut *mut c_char, e: &Error) {
    error!(error = %e, "Plugin creation failed");
    if errmsg.is_null() {
        return;
    }
    let message = CString::new(e.to_string().replace('\0', "\\0")).unwrap_or_default();
    unsafe { *errmsg = message.into_raw() };
}

// ================================================================
// Plugin construction
// ================================================================

/// Creates a plugin from a wasm module or JSON manifest.
///
/// # Safety
/// `wasm` must point to `wasm_size` readable bytes. `functions` must point to
/// `n_functions` pointers returned by `plughost_function_new`. `errmsg`, when
/// not null, receives an error string to free with
/// `plughost_plugin_new_error_free`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_new(
    wasm: *const u8,
    wasm_size: Size,
    functions: *const *const Function,
    n_functions: Size,
    with_wasi: bool,
    errmsg: *mut *mut c_char,
) -> *mut Plugin {
    unsafe { new_plugin(wasm, wasm_size, functions, n_functions, with_wasi, None, errmsg) }
}

/// Like `plughost_plugin_new`, with a per-call fuel budget.
///
/// # Safety
/// Same contract as `plughost_plugin_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_new_with_fuel_limit(
    wasm: *const u8,
    wasm_size: Size,
    functions: *const *const Function,
    n_functions: Size,
    with_wasi: bool,
    fuel_limit: u64,
    errmsg: *mut *mut c_char,
) -> *mut Plugin {
    unsafe {
        new_plugin(
            wasm,
            wasm_size,
            functions,
            n_functions,
            with_wasi,
            Some(fuel_limit),
            errmsg,
        )
    }
}

unsafe fn new_plugin(
    wasm: *const u8,
    wasm_size: Size,
    functions: *const *const Function,
    n_functions: Size,
    with_wasi: bool,
    fuel_limit: Option<u64>,
    errmsg: *mut *mut c_char,
) -> *mut Plugin {
    let (bytes, functions) =
        unsafe { (bytes_arg(wasm, wasm_size), functions_arg(functions, n_functions)) };
    match Plugin::new(bytes, functions, with_wasi, fuel_limit) {
        Ok(plugin) => Box::into_raw(Box::new(plugin)),
        Err(e) => {
            unsafe { set_errmsg(errmsg, &e) };
            std::ptr::null_mut()
        }
    }
}

/// Compiles a plugin without instantiating it.
///
/// # Safety
/// Same contract as `plughost_plugin_new`. The result must be freed with
/// `plughost_compiled_plugin_free`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_compiled_plugin_new(
    wasm: *const u8,
    wasm_size: Size,
    functions: *const *const Function,
    n_functions: Size,
    with_wasi: bool,
    errmsg: *mut *mut c_char,
) -> *mut CompiledPlugin {
    let (bytes, functions) =
        unsafe { (bytes_arg(wasm, wasm_size), functions_arg(functions, n_functions)) };
    match CompiledPlugin::new(bytes, functions, with_wasi, None) {
        Ok(compiled) => Box::into_raw(Box::new(compiled)),
        Err(e) => {
            unsafe { set_errmsg(errmsg, &e) };
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `compiled` must come from `plughost_compiled_plugin_new` and not be used
/// afterwards. Plugins instantiated from it stay valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_compiled_plugin_free(compiled: *mut CompiledPlugin) {
    if compiled.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(compiled) });
}

/// Instantiates a compiled plugin. May be called concurrently.
///
/// # Safety
/// `compiled` must be a live pointer from `plughost_compiled_plugin_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_new_from_compiled(
    compiled: *const CompiledPlugin,
    errmsg: *mut *mut c_char,
) -> *mut Plugin {
    let Some(compiled) = (unsafe { compiled.as_ref() }) else {
        unsafe { set_errmsg(errmsg, &Error::Config("compiled plugin is null".into())) };
        return std::ptr::null_mut();
    };
    match compiled.instantiate() {
        Ok(plugin) => Box::into_raw(Box::new(plugin)),
        Err(e) => {
            unsafe { set_errmsg(errmsg, &e) };
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `err` must be an error string produced by a plugin constructor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_new_error_free(err: *mut c_char) {
    if err.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(err) });
}

/// # Safety
/// `plugin` must come from a plugin constructor and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_free(plugin: *mut Plugin) {
    if plugin.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(plugin) });
}

// ================================================================
// Cancellation
// ================================================================

/// Returns the plugin's cancel handle, valid until the plugin is freed.
///
/// # Safety
/// `plugin` must be a live plugin pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_cancel_handle(
    plugin: *const Plugin,
) -> *const CancelHandle {
    match unsafe { plugin.as_ref() } {
        Some(plugin) => Arc::as_ptr(plugin.cancel_handle()),
        None => std::ptr::null(),
    }
}

/// Interrupts the call currently running on the handle's plugin.
/// A request made while no call is running is discarded when the next call
/// starts.
///
/// # Safety
/// `handle` must come from `plughost_plugin_cancel_handle` of a live plugin.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_cancel(handle: *const CancelHandle) -> bool {
    match unsafe { handle.as_ref() } {
        Some(handle) => {
            debug!("Plugin cancel requested");
            handle.cancel();
            true
        }
        None => false,
    }
}

// ================================================================
// Plugin operations
// ================================================================

/// Merges a JSON object into the plugin config.
///
/// # Safety
/// `plugin` must be live; `json` must point to `json_size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_config(
    plugin: *mut Plugin,
    json: *const u8,
    json_size: Size,
) -> bool {
    let Some(plugin) = (unsafe { plugin.as_mut() }) else {
        return false;
    };
    let json = unsafe { bytes_arg(json, json_size) };
    match plugin.update_config(json) {
        Ok(()) => true,
        Err(e) => {
            warn!(plugin_id = %plugin.id(), error = %e, "Rejected config update");
            false
        }
    }
}

/// # Safety
/// `plugin` must be live; `name` must be a null-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_function_exists(
    plugin: *mut Plugin,
    name: *const c_char,
) -> bool {
    let (Some(plugin), Some(name)) = (unsafe { plugin.as_mut() }, unsafe { str_arg(name) }) else {
        return false;
    };
    plugin.function_exists(name)
}

/// Calls an export and returns its exit code. Check `plughost_plugin_error`
/// afterwards; output is only meaningful when it is null.
///
/// # Safety
/// `plugin` must be live; `func_name` null-terminated; `data` must point to
/// `data_len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_call(
    plugin: *mut Plugin,
    func_name: *const c_char,
    data: *const u8,
    data_len: Size,
) -> i32 {
    unsafe {
        plughost_plugin_call_with_host_context(
            plugin,
            func_name,
            data,
            data_len,
            std::ptr::null_mut(),
        )
    }
}

/// Like `plughost_plugin_call`; `host_context` is readable from host
/// functions through `plughost_current_plugin_host_context` for the call's
/// duration.
///
/// # Safety
/// Same contract as `plughost_plugin_call`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_call_with_host_context(
    plugin: *mut Plugin,
    func_name: *const c_char,
    data: *const u8,
    data_len: Size,
    host_context: *mut c_void,
) -> i32 {
    let Some(plugin) = (unsafe { plugin.as_mut() }) else {
        return CALL_FAILED;
    };
    let Some(name) = (unsafe { str_arg(func_name) }) else {
        return CALL_FAILED;
    };
    let data = unsafe { bytes_arg(data, data_len) };
    plugin.call_with_host_context(name, data, host_context)
}

/// Error from the last call, or null.
///
/// # Safety
/// `plugin` must be live. The string is valid until the next call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_error(plugin: *mut Plugin) -> *const c_char {
    match unsafe { plugin.as_ref() }.and_then(Plugin::error) {
        Some(e) => e.as_ptr(),
        None => std::ptr::null(),
    }
}

/// # Safety
/// `plugin` must be live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_output_length(plugin: *mut Plugin) -> Size {
    unsafe { plugin.as_ref() }.map_or(0, |p| p.output().len() as Size)
}

/// # Safety
/// `plugin` must be live. The data is valid until the next call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_output_data(plugin: *mut Plugin) -> *const u8 {
    unsafe { plugin.as_ref() }.map_or(std::ptr::null(), |p| p.output().as_ptr())
}

/// Pointer to the plugin's 16-byte UUID.
///
/// # Safety
/// `plugin` must be live.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_plugin_id(plugin: *mut Plugin) -> *const u8 {
    unsafe { plugin.as_ref() }.map_or(std::ptr::null(), |p| p.id().as_bytes().as_ptr())
}

// ================================================================
// Host functions
// ================================================================

/// Registers a host function.
///
/// # Safety
/// `name` must be null-terminated; `inputs`/`outputs` must point to
/// `n_inputs`/`n_outputs` types. `user_data` is passed to every invocation of
/// `func` and released with `free_user_data` once neither the function nor
/// any plugin linked against it is alive.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_function_new(
    name: *const c_char,
    inputs: *const ValType,
    n_inputs: Size,
    outputs: *const ValType,
    n_outputs: Size,
    func: FunctionCallback,
    user_data: *mut c_void,
    free_user_data: FreeUserData,
) -> *mut Function {
    let Some(name) = (unsafe { str_arg(name) }) else {
        return std::ptr::null_mut();
    };
    let (params, results) = unsafe { (types_arg(inputs, n_inputs), types_arg(outputs, n_outputs)) };
    Box::into_raw(Box::new(Function::new(
        name,
        params,
        results,
        func,
        user_data,
        free_user_data,
    )))
}

/// # Safety
/// `f` must come from `plughost_function_new` and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_function_free(f: *mut Function) {
    if f.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(f) });
}

/// Sets the import module name. Affects plugins created afterwards.
///
/// # Safety
/// `f` must be live; `namespace` null-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_function_set_namespace(
    f: *mut Function,
    namespace: *const c_char,
) {
    if let (Some(f), Some(namespace)) = (unsafe { f.as_mut() }, unsafe { str_arg(namespace) }) {
        f.set_namespace(namespace);
    }
}

// ================================================================
// Call context (valid only inside a host function)
// ================================================================

/// Current base address of the kernel memory. Re-query after every
/// allocation; growth may move it.
///
/// # Safety
/// `plugin` must be the pointer passed to the running host function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_memory(plugin: *mut CurrentPlugin<'_>) -> *mut u8 {
    unsafe { plugin.as_mut() }.map_or(std::ptr::null_mut(), |p| p.memory_base())
}

/// Total size of the kernel memory in bytes.
///
/// # Safety
/// See `plughost_current_plugin_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_memory_size(
    plugin: *mut CurrentPlugin<'_>,
) -> Size {
    unsafe { plugin.as_ref() }.map_or(0, |p| p.memory_size())
}

/// Length of the block at `offset`, 0 if it is not a live block.
///
/// # Safety
/// See `plughost_current_plugin_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_memory_length(
    plugin: *mut CurrentPlugin<'_>,
    offset: u64,
) -> Size {
    unsafe { plugin.as_ref() }.map_or(0, |p| p.block_len(offset))
}

/// Allocates `n` bytes; returns 0 on failure.
///
/// # Safety
/// See `plughost_current_plugin_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_memory_alloc(
    plugin: *mut CurrentPlugin<'_>,
    n: Size,
) -> u64 {
    let Some(plugin) = (unsafe { plugin.as_mut() }) else {
        return 0;
    };
    match plugin.alloc(n) {
        Ok(offset) => offset,
        Err(e) => {
            warn!(len = n, error = %e, "Host allocation failed");
            0
        }
    }
}

/// # Safety
/// See `plughost_current_plugin_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_memory_free(
    plugin: *mut CurrentPlugin<'_>,
    offset: u64,
) {
    if let Some(plugin) = unsafe { plugin.as_mut() } {
        plugin.free(offset);
    }
}

/// The host context passed to the in-flight call, or null.
///
/// # Safety
/// See `plughost_current_plugin_memory`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_host_context(
    plugin: *mut CurrentPlugin<'_>,
) -> *mut c_void {
    unsafe { plugin.as_ref() }.map_or(std::ptr::null_mut(), |p| p.host_context())
}

/// Marks the running host function as failed; the guest call traps with
/// `msg` once the function returns.
///
/// # Safety
/// See `plughost_current_plugin_memory`; `msg` must point to `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_current_plugin_set_error(
    plugin: *mut CurrentPlugin<'_>,
    msg: *const u8,
    len: Size,
) {
    if let Some(plugin) = unsafe { plugin.as_mut() } {
        let message = String::from_utf8_lossy(unsafe { bytes_arg(msg, len) }).into_owned();
        plugin.set_error(message);
    }
}

// ================================================================
// Misc
// ================================================================

/// Configures log output. See [`crate::set_log_file`].
///
/// # Safety
/// Both arguments must be null-terminated strings; a null `log_level`
/// means `info`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn plughost_log_file(
    filename: *const c_char,
    log_level: *const c_char,
) -> bool {
    let Some(filename) = (unsafe { str_arg(filename) }) else {
        return false;
    };
    let level = unsafe { str_arg(log_level) }.unwrap_or("info");
    crate::logging::set_log_file(filename, level).is_ok()
}

/// Runtime version as a static null-terminated string.
#[unsafe(no_mangle)]
pub extern "C" fn plughost_version() -> *const c_char {
    VERSION.as_ptr()
}
