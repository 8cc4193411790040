//! Compile once, instantiate many times.

use crate::error::{Error, Result};
use crate::function::Function;
use crate::plugin::{Plugin, function_ptrs, load_error};
use plughost_manifest::Manifest;
use plughost_sys as sys;
use std::ffi::c_char;
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

struct RawCompiled(NonNull<sys::CompiledPlugin>);

// SAFETY: the native compiled plugin is immutable and may be instantiated
// from any thread concurrently.
unsafe impl Send for RawCompiled {}
unsafe impl Sync for RawCompiled {}

/// A parsed and compiled plugin. Instances share the compiled modules.
pub struct CompiledPlugin {
    raw: RwLock<Option<RawCompiled>>,
    functions: Vec<Function>,
}

impl CompiledPlugin {
    pub fn new(
        manifest: &Manifest,
        functions: impl IntoIterator<Item = Function>,
        wasi: bool,
    ) -> Result<Self> {
        let wasm = manifest.encode()?;
        Self::from_bytes(wasm, functions, wasi)
    }

    /// Compiles a wasm binary, wasm text, or an encoded manifest.
    pub fn from_bytes(
        wasm: impl AsRef<[u8]>,
        functions: impl IntoIterator<Item = Function>,
        wasi: bool,
    ) -> Result<Self> {
        let wasm = wasm.as_ref();
        let functions: Vec<Function> = functions.into_iter().collect();
        let ptrs = function_ptrs(&functions);
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        let raw = unsafe {
            sys::plughost_compiled_plugin_new(
                wasm.as_ptr(),
                wasm.len() as sys::Size,
                ptrs.as_ptr(),
                ptrs.len() as sys::Size,
                wasi,
                &mut errmsg,
            )
        };
        let raw = NonNull::new(raw).ok_or_else(|| load_error(errmsg))?;
        debug!(functions = functions.len(), "Compiled plugin ready");
        Ok(Self {
            raw: RwLock::new(Some(RawCompiled(raw))),
            functions,
        })
    }

    /// Creates a new independent instance. Safe to call concurrently.
    pub fn instantiate(&self) -> Result<Plugin> {
        let raw = self.raw.read().unwrap_or_else(PoisonError::into_inner);
        let compiled = raw.as_ref().ok_or(Error::Disposed)?;
        let mut errmsg: *mut c_char = std::ptr::null_mut();
        let plugin =
            unsafe { sys::plughost_plugin_new_from_compiled(compiled.0.as_ptr(), &mut errmsg) };
        match NonNull::new(plugin) {
            Some(plugin) => Ok(Plugin::from_raw(plugin, self.functions.clone())),
            None => Err(load_error(errmsg)),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.raw.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Frees the compiled modules' handle. Existing instances keep working.
    pub fn dispose(&self) {
        let taken = self.raw.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(compiled) = taken {
            unsafe { sys::plughost_compiled_plugin_free(compiled.0.as_ptr()) };
            debug!("Compiled plugin disposed");
        }
    }
}

impl Drop for CompiledPlugin {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for CompiledPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPlugin")
            .field("disposed", &self.is_disposed())
            .field("functions", &self.functions)
            .finish()
    }
}
