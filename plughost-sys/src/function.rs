//! Host functions registered by the embedding application.

use crate::current_plugin::CurrentPlugin;
use crate::error::Error;
use crate::state::PluginState;
use crate::types::{Size, Val, ValType};
use std::ffi::c_void;
use std::sync::Arc;
use tracing::trace;
use wasmtime::{Caller, Engine, FuncType, Linker};

/// Native host function calling convention. Outputs are written in place.
pub type FunctionCallback = unsafe extern "C" fn(
    plugin: *mut CurrentPlugin<'_>,
    inputs: *const Val,
    n_inputs: Size,
    outputs: *mut Val,
    n_outputs: Size,
    user_data: *mut c_void,
);

/// Destructor for a function's user data.
pub type FreeUserData = Option<unsafe extern "C" fn(user_data: *mut c_void)>;

pub(crate) struct UserData {
    ptr: *mut c_void,
    free: FreeUserData,
}

// SAFETY: the registering host guarantees its user data may be used from any
// thread that calls into a plugin.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl Drop for UserData {
    fn drop(&mut self) {
        if let Some(free) = self.free {
            if !self.ptr.is_null() {
                // SAFETY: `free` was registered alongside `ptr` and runs once.
                unsafe { free(self.ptr) };
            }
        }
    }
}

/// A host function descriptor.
///
/// Cloning is cheap; plugins keep their own clone so the callback's user
/// data lives until the last plugin linked against it is freed.
#[derive(Clone)]
pub struct Function {
    pub(crate) name: String,
    pub(crate) namespace: Option<String>,
    pub(crate) params: Vec<ValType>,
    pub(crate) results: Vec<ValType>,
    callback: FunctionCallback,
    user_data: Arc<UserData>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        callback: FunctionCallback,
        user_data: *mut c_void,
        free_user_data: FreeUserData,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
            callback,
            user_data: Arc::new(UserData {
                ptr: user_data,
                free: free_user_data,
            }),
        }
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = Some(namespace.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("env")
    }

    pub(crate) fn define(
        &self,
        linker: &mut Linker<PluginState>,
        engine: &Engine,
    ) -> Result<(), Error> {
        let ty = FuncType::new(
            engine,
            self.params.iter().map(|t| t.to_wasmtime()),
            self.results.iter().map(|t| t.to_wasmtime()),
        );
        let function = self.clone();
        linker.func_new(self.namespace(), &self.name, ty, move |caller, params, results| {
            function.invoke(caller, params, results)
        })?;
        Ok(())
    }

    fn invoke(
        &self,
        caller: Caller<'_, PluginState>,
        params: &[wasmtime::Val],
        results: &mut [wasmtime::Val],
    ) -> wasmtime::Result<()> {
        trace!(function = %self.name, namespace = self.namespace(), "Host function call");
        let inputs = params
            .iter()
            .map(|p| {
                Val::from_wasmtime(p).ok_or_else(|| {
                    wasmtime::Error::msg(format!(
                        "host function '{}' received an unsupported value type",
                        self.name
                    ))
                })
            })
            .collect::<wasmtime::Result<Vec<Val>>>()?;
        let mut outputs: Vec<Val> = self.results.iter().map(|t| Val::zero(*t)).collect();

        let mut current = CurrentPlugin::new(caller);
        // SAFETY: both buffers hold exactly the advertised number of values and
        // outlive the callback; `current` is valid until it returns.
        unsafe {
            (self.callback)(
                &mut current,
                inputs.as_ptr(),
                inputs.len() as Size,
                outputs.as_mut_ptr(),
                outputs.len() as Size,
                self.user_data.ptr,
            );
        }

        if let Some(message) = current.take_error() {
            return Err(wasmtime::Error::msg(format!(
                "host function '{}' failed: {message}",
                self.name
            )));
        }
        for ((slot, out), ty) in results.iter_mut().zip(&outputs).zip(&self.results) {
            if out.t != *ty {
                return Err(wasmtime::Error::msg(format!(
                    "host function '{}' returned {} where {} was declared",
                    self.name, out.t, ty
                )));
            }
            *slot = out.to_wasmtime();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("namespace", &self.namespace())
            .field("params", &self.params)
            .field("results", &self.results)
            .finish()
    }
}
