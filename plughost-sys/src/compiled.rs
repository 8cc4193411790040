//! Compiled-but-uninstantiated plugins.

use crate::engine::shared_engine;
use crate::error::Error;
use crate::function::Function;
use crate::loader::{self, LoadOptions};
use crate::plugin::Plugin;
use std::sync::Arc;
use tracing::info;
use wasmtime::{Engine, Module};

/// Everything an instantiation needs; shared read-only between instances.
pub(crate) struct Compiled {
    pub(crate) engine: Engine,
    pub(crate) modules: Vec<(String, Module)>,
    pub(crate) main: usize,
    pub(crate) functions: Vec<Function>,
    pub(crate) with_wasi: bool,
    pub(crate) fuel_limit: Option<u64>,
    pub(crate) options: LoadOptions,
}

/// A parsed and compiled plugin that can be instantiated many times.
pub struct CompiledPlugin {
    inner: Arc<Compiled>,
}

impl CompiledPlugin {
    pub fn new(
        wasm: &[u8],
        functions: Vec<Function>,
        with_wasi: bool,
        fuel_limit: Option<u64>,
    ) -> Result<Self, Error> {
        let engine = shared_engine()?;
        let sources = loader::load(engine, wasm)?;
        info!(
            modules = sources.modules.len(),
            functions = functions.len(),
            with_wasi,
            fuel_limit = ?fuel_limit,
            "Plugin compiled"
        );
        Ok(Self {
            inner: Arc::new(Compiled {
                engine: engine.clone(),
                modules: sources.modules,
                main: sources.main,
                functions,
                with_wasi,
                fuel_limit,
                options: sources.options,
            }),
        })
    }

    /// Creates an independent instance sharing the compiled modules.
    pub fn instantiate(&self) -> Result<Plugin, Error> {
        Plugin::instantiate(Arc::clone(&self.inner))
    }
}
