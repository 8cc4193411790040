//! A single plugin instance: one `wasmtime::Store` with its kernel memory,
//! linked host functions, and the main module's instance.

use crate::compiled::{Compiled, CompiledPlugin};
use crate::error::Error;
use crate::function::Function;
use crate::kernel;
use crate::state::{CancelHandle, HostContext, PluginState, TrackingLimiter};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wasmtime::{Instance, Linker, Memory, MemoryType, Store, Trap, UpdateDeadline};
use wasmtime_wasi::WasiCtxBuilder;

/// Exit code reported when a call fails before the guest produced one.
pub const CALL_FAILED: i32 = -1;

pub struct Plugin {
    id: Uuid,
    store: Store<PluginState>,
    instance: Instance,
    cancel: Arc<CancelHandle>,
    compiled: Arc<Compiled>,
    output: Vec<u8>,
    error: Option<CString>,
}

impl Plugin {
    /// Compiles and instantiates in one step.
    pub fn new(
        wasm: &[u8],
        functions: Vec<Function>,
        with_wasi: bool,
        fuel_limit: Option<u64>,
    ) -> Result<Self, Error> {
        CompiledPlugin::new(wasm, functions, with_wasi, fuel_limit)?.instantiate()
    }

    pub(crate) fn instantiate(compiled: Arc<Compiled>) -> Result<Self, Error> {
        let engine = &compiled.engine;
        let mut linker: Linker<PluginState> = Linker::new(engine);
        linker.allow_shadowing(true);
        kernel::add_to_linker(&mut linker)?;
        if compiled.with_wasi {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |s: &mut PluginState| &mut s.wasi)?;
        }
        for function in &compiled.functions {
            function.define(&mut linker, engine)?;
        }

        let id = Uuid::new_v4();
        let cancel = Arc::new(CancelHandle::default());
        let state = PluginState {
            plugin_id: id,
            kernel: Default::default(),
            memory: None,
            config: compiled.options.config.clone(),
            vars: BTreeMap::new(),
            max_var_bytes: compiled.options.max_var_bytes,
            limiter: TrackingLimiter::new(compiled.options.max_pages),
            wasi: WasiCtxBuilder::new().inherit_stdio().build_p1(),
            host_context: HostContext::none(),
            host_error: None,
            cancel: Arc::clone(&cancel),
            deadline: None,
        };

        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limiter);
        store.epoch_deadline_callback(|ctx| {
            let state = ctx.data();
            if state.cancel.is_cancelled() {
                return Err(wasmtime::Error::new(Error::Cancelled));
            }
            if state.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(wasmtime::Error::new(Error::Timeout));
            }
            Ok(UpdateDeadline::Continue(1))
        });
        store.set_epoch_deadline(1);
        store.set_fuel(u64::MAX)?;

        let memory = Memory::new(&mut store, MemoryType::new(1, compiled.options.max_pages))?;
        store.data_mut().memory = Some(memory);

        for (i, (name, module)) in compiled.modules.iter().enumerate() {
            if i == compiled.main {
                continue;
            }
            let instance = linker.instantiate(&mut store, module)?;
            linker.instance(&mut store, name, instance)?;
        }
        let (main_name, main_module) = &compiled.modules[compiled.main];
        let instance = linker.instantiate(&mut store, main_module)?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            debug!(plugin_id = %id, module = %main_name, "Running _initialize");
            init.call(&mut store, ())?;
        }

        info!(plugin_id = %id, module = %main_name, "Plugin instantiated");
        Ok(Self {
            id,
            store,
            instance,
            cancel,
            compiled,
            output: Vec::new(),
            error: None,
        })
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Cancel flag for this instance; valid as long as the plugin is.
    pub fn cancel_handle(&self) -> &Arc<CancelHandle> {
        &self.cancel
    }

    pub fn function_exists(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    /// Merges a JSON object of `key -> string | null` into the config.
    /// `null` removes the key.
    pub fn update_config(&mut self, json: &[u8]) -> Result<(), Error> {
        let update: BTreeMap<String, Option<String>> = serde_json::from_slice(json)?;
        let config = &mut self.store.data_mut().config;
        for (key, value) in update {
            match value {
                Some(value) => {
                    config.insert(key, value);
                }
                None => {
                    config.remove(&key);
                }
            }
        }
        debug!(plugin_id = %self.id, keys = config.len(), "Plugin config updated");
        Ok(())
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn error(&self) -> Option<&CString> {
        self.error.as_ref()
    }

    /// Calls an export. Returns the guest's exit code; failures are recorded
    /// in [`Plugin::error`], success leaves it empty.
    pub fn call(&mut self, name: &str, input: &[u8]) -> i32 {
        self.call_with_host_context(name, input, std::ptr::null_mut())
    }

    pub fn call_with_host_context(
        &mut self,
        name: &str,
        input: &[u8],
        host_context: *mut std::ffi::c_void,
    ) -> i32 {
        self.output.clear();
        self.error = None;
        // A cancel requested while no call was running belongs to no call.
        self.cancel.reset();

        let result = self.call_inner(name, input, HostContext(host_context));

        let state = self.store.data_mut();
        state.host_context = HostContext::none();
        state.deadline = None;
        state.host_error = None;
        self.cancel.reset();

        match result {
            Ok(rc) => {
                let guest_error = kernel::guest_error(&self.store);
                if guest_error.is_some() || rc != 0 {
                    let message = guest_error
                        .unwrap_or_else(|| format!("plugin returned non-zero exit code: {rc}"));
                    warn!(
                        plugin_id = %self.id,
                        function = name,
                        rc,
                        error = %message,
                        "Plugin call failed"
                    );
                    self.output.clear();
                    self.set_error(message);
                }
                rc
            }
            Err(e) => {
                warn!(plugin_id = %self.id, function = name, error = %e, "Plugin call failed");
                self.set_error(e.to_string());
                CALL_FAILED
            }
        }
    }

    fn call_inner(
        &mut self,
        name: &str,
        input: &[u8],
        host_context: HostContext,
    ) -> Result<i32, Error> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        let ty = func.ty(&self.store);
        if ty.params().len() != 0 {
            return Err(Error::InvalidExport {
                name: name.to_string(),
                reason: "exports must take no parameters".into(),
            });
        }
        let mut results: Vec<wasmtime::Val> = ty.results().map(|_| wasmtime::Val::I32(0)).collect();

        kernel::set_input(&mut self.store, input)?;
        self.store.set_fuel(self.compiled.fuel_limit.unwrap_or(u64::MAX))?;
        let state = self.store.data_mut();
        state.host_context = host_context;
        state.deadline = self.compiled.options.timeout.map(|t| Instant::now() + t);
        self.store.set_epoch_deadline(1);

        debug!(plugin_id = %self.id, function = name, input_bytes = input.len(), "Calling plugin");
        let call_start = Instant::now();
        let outcome = func.call(&mut self.store, &[], &mut results);
        debug!(
            plugin_id = %self.id,
            function = name,
            elapsed_ms = call_start.elapsed().as_millis() as u64,
            memory_bytes = self.store.data().limiter.current_memory_bytes(),
            "Plugin call returned"
        );

        if let Err(e) = outcome {
            return Err(classify(e));
        }
        let rc = match results.first() {
            Some(wasmtime::Val::I32(rc)) => *rc,
            Some(wasmtime::Val::I64(rc)) => *rc as i32,
            _ => 0,
        };
        self.output = kernel::output(&self.store)?;
        Ok(rc)
    }

    fn set_error(&mut self, message: String) {
        self.error = Some(CString::new(message.replace('\0', "\\0")).unwrap_or_default());
    }
}

/// Maps a failed call onto the runtime's error vocabulary. Cancellation and
/// timeout both surface as the error the epoch callback returned; any other
/// failure keeps its own message even if a cancel arrived meanwhile.
fn classify(e: wasmtime::Error) -> Error {
    if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return Error::OutOfFuel;
    }
    match e.downcast_ref::<Error>() {
        Some(Error::Cancelled) => Error::Cancelled,
        Some(Error::Timeout) => Error::Timeout,
        _ => Error::Wasm(e),
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        debug!(plugin_id = %self.id, "Plugin freed");
    }
}
