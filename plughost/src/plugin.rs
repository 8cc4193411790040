//! Plugin instances.

use crate::cancel::{CancelHandle, CancelSignal};
use crate::error::{Error, Result};
use crate::function::Function;
use plughost_manifest::{Manifest, ManifestError};
use plughost_sys as sys;
use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const LOAD_FALLBACK_MESSAGE: &str = "unable to load plugin";
const CANCELLED_MESSAGE: &str = "plugin call cancelled";

/// Construction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginOptions {
    /// Link WASI preview 1 imports.
    pub wasi: bool,
    /// Fuel budget per call; unlimited when `None`.
    pub fuel_limit: Option<u64>,
}

impl PluginOptions {
    pub fn with_wasi(mut self, wasi: bool) -> Self {
        self.wasi = wasi;
        self
    }

    pub fn with_fuel_limit(mut self, fuel_limit: u64) -> Self {
        self.fuel_limit = Some(fuel_limit);
        self
    }
}

/// Turns a constructor's error out-parameter into [`Error::Load`].
pub(crate) fn load_error(errmsg: *mut c_char) -> Error {
    if errmsg.is_null() {
        return Error::Load(LOAD_FALLBACK_MESSAGE.to_string());
    }
    let message = unsafe { CStr::from_ptr(errmsg) }.to_string_lossy().into_owned();
    unsafe { sys::plughost_plugin_new_error_free(errmsg) };
    Error::Load(message)
}

/// The runtime reports an interrupt with exactly [`CANCELLED_MESSAGE`]. A
/// host function that bails out on the caller's signal surfaces it inside a
/// longer trap message, which only counts once the signal has fired.
fn is_cancellation(message: &str, signal_fired: bool) -> bool {
    message == CANCELLED_MESSAGE || (signal_fired && message.contains(CANCELLED_MESSAGE))
}

pub(crate) fn function_ptrs(functions: &[Function]) -> Vec<*const sys::Function> {
    functions.iter().map(Function::as_raw).collect()
}

/// A live plugin instance.
///
/// Calls take `&mut self` and therefore never overlap; use one plugin per
/// thread, or instantiate several from a [`crate::CompiledPlugin`].
pub struct Plugin {
    raw: NonNull<sys::Plugin>,
    disposed: AtomicBool,
    cancel: CancelHandle,
    id: Uuid,
    // Keeps the host function registrations alive alongside the instance.
    functions: Vec<Function>,
}

// SAFETY: the native instance has no thread affinity; `&mut self` on calls
// keeps it from being used by two threads at once.
unsafe impl Send for Plugin {}

impl Plugin {
    /// Loads the plugin described by `manifest`.
    pub fn new(
        manifest: &Manifest,
        functions: impl IntoIterator<Item = Function>,
        wasi: bool,
    ) -> Result<Self> {
        let wasm = manifest.encode()?;
        Self::new_with_options(wasm, functions, PluginOptions::default().with_wasi(wasi))
    }

    /// Loads a plugin from a wasm binary, wasm text, or an encoded manifest.
    pub fn new_with_options(
        wasm: impl AsRef<[u8]>,
        functions: impl IntoIterator<Item = Function>,
        options: PluginOptions,
    ) -> Result<Self> {
        let wasm = wasm.as_ref();
        let functions: Vec<Function> = functions.into_iter().collect();
        let ptrs = function_ptrs(&functions);
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        let raw = unsafe {
            match options.fuel_limit {
                Some(fuel_limit) => sys::plughost_plugin_new_with_fuel_limit(
                    wasm.as_ptr(),
                    wasm.len() as sys::Size,
                    ptrs.as_ptr(),
                    ptrs.len() as sys::Size,
                    options.wasi,
                    fuel_limit,
                    &mut errmsg,
                ),
                None => sys::plughost_plugin_new(
                    wasm.as_ptr(),
                    wasm.len() as sys::Size,
                    ptrs.as_ptr(),
                    ptrs.len() as sys::Size,
                    options.wasi,
                    &mut errmsg,
                ),
            }
        };
        match NonNull::new(raw) {
            Some(raw) => Ok(Self::from_raw(raw, functions)),
            None => Err(load_error(errmsg)),
        }
    }

    pub(crate) fn from_raw(raw: NonNull<sys::Plugin>, functions: Vec<Function>) -> Self {
        let cancel = CancelHandle::new(unsafe { sys::plughost_plugin_cancel_handle(raw.as_ptr()) });
        let id_ptr = unsafe { sys::plughost_plugin_id(raw.as_ptr()) };
        let id = if id_ptr.is_null() {
            Uuid::nil()
        } else {
            let mut bytes = [0u8; 16];
            // SAFETY: the runtime returns a pointer to the 16 id bytes.
            bytes.copy_from_slice(unsafe { std::slice::from_raw_parts(id_ptr, 16) });
            Uuid::from_bytes(bytes)
        };
        info!(plugin_id = %id, functions = functions.len(), "Plugin ready");
        Self {
            raw,
            disposed: AtomicBool::new(false),
            cancel,
            id,
            functions,
        }
    }

    fn raw(&self) -> Result<*mut sys::Plugin> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(self.raw.as_ptr())
    }

    pub fn id(&self) -> Result<Uuid> {
        self.raw()?;
        Ok(self.id)
    }

    /// Handle that interrupts this plugin's running call from any thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn function_exists(&self, name: &str) -> Result<bool> {
        let raw = self.raw()?;
        let name = CString::new(name)?;
        Ok(unsafe { sys::plughost_plugin_function_exists(raw, name.as_ptr()) })
    }

    /// Merges `config` into the plugin config; `None` removes a key.
    pub fn update_config(&mut self, config: &BTreeMap<String, Option<String>>) -> Result<bool> {
        let raw = self.raw()?;
        let json = serde_json::to_vec(config).map_err(ManifestError::from)?;
        let updated =
            unsafe { sys::plughost_plugin_config(raw, json.as_ptr(), json.len() as sys::Size) };
        debug!(plugin_id = %self.id, keys = config.len(), updated, "Config update");
        Ok(updated)
    }

    /// Calls the export `name` with `input` and returns its output.
    pub fn call(&mut self, name: &str, input: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.call_with(name, input, None, None)
    }

    /// Like [`Plugin::call`]. A fired `signal` interrupts the call, and
    /// `host_context` is reachable from host functions for its duration.
    pub fn call_with(
        &mut self,
        name: &str,
        input: impl AsRef<[u8]>,
        signal: Option<&CancelSignal>,
        host_context: Option<&mut dyn Any>,
    ) -> Result<Vec<u8>> {
        let raw = self.raw()?;
        let input = input.as_ref();
        if signal.is_some_and(CancelSignal::is_cancelled) {
            debug!(plugin_id = %self.id, function = name, "Call cancelled before start");
            return Err(Error::Cancelled);
        }
        let c_name = CString::new(name)?;

        let guard = signal.map(|signal| {
            let handle = self.cancel.clone();
            signal.on_cancel(move || {
                handle.cancel();
            })
        });

        let mut host_context = host_context;
        let context_ptr = match &mut host_context {
            Some(context) => (context as *mut &mut dyn Any).cast::<c_void>(),
            None => std::ptr::null_mut(),
        };
        let rc = unsafe {
            sys::plughost_plugin_call_with_host_context(
                raw,
                c_name.as_ptr(),
                input.as_ptr(),
                input.len() as sys::Size,
                context_ptr,
            )
        };
        drop(guard);

        let error = unsafe { sys::plughost_plugin_error(raw) };
        if !error.is_null() {
            let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
            if is_cancellation(&message, signal.is_some_and(CancelSignal::is_cancelled)) {
                debug!(plugin_id = %self.id, function = name, "Call cancelled");
                return Err(Error::Cancelled);
            }
            return Err(Error::Execution { message, code: rc });
        }

        let len = unsafe { sys::plughost_plugin_output_length(raw) } as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = unsafe { sys::plughost_plugin_output_data(raw) };
        // SAFETY: the output buffer holds `len` bytes until the next call.
        Ok(unsafe { std::slice::from_raw_parts(data, len) }.to_vec())
    }

    /// Releases the native instance. Later calls fail with
    /// [`Error::Disposed`]; disposing again does nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.release();
        unsafe { sys::plughost_plugin_free(self.raw.as_ptr()) };
        debug!(plugin_id = %self.id, "Plugin disposed");
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .field("functions", &self.functions)
            .finish()
    }
}
