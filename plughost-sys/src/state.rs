//! Per-store plugin state.

use crate::kernel::Kernel;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;
use wasmtime::{Memory, ResourceLimiter};
use wasmtime_wasi::p1::WasiP1Ctx;

/// Size of a wasm page in bytes.
pub const PAGE_SIZE: u64 = 65_536;

/// Out-of-band cancellation flag, polled by the epoch deadline callback.
#[derive(Debug, Default)]
pub struct CancelHandle {
    cancelled: AtomicBool,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Opaque per-call pointer handed through to host functions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostContext(pub(crate) *mut c_void);

// SAFETY: the pointer is only dereferenced by the host function running on the
// calling thread while the call that installed it is in flight.
unsafe impl Send for HostContext {}

impl HostContext {
    pub(crate) fn none() -> Self {
        HostContext(std::ptr::null_mut())
    }
}

/// A resource limiter that caps every linear memory and tracks the last
/// granted size.
pub struct TrackingLimiter {
    /// Maximum bytes a single memory may grow to, if limited.
    max_memory: Option<usize>,
    /// Size of the most recent successful memory growth.
    current_memory: usize,
    max_table_elements: usize,
}

impl TrackingLimiter {
    pub fn new(max_pages: Option<u32>) -> Self {
        Self {
            max_memory: max_pages.map(|p| p as usize * PAGE_SIZE as usize),
            current_memory: 0,
            max_table_elements: 20_000,
        }
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory
    }
}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        match self.max_memory {
            Some(max) if desired > max => {
                debug!(
                    current = current,
                    desired = desired,
                    max = max,
                    "Memory growth denied - would exceed limit"
                );
                Ok(false)
            }
            _ => {
                self.current_memory = desired;
                Ok(true)
            }
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}

/// State stored in each plugin's `wasmtime::Store`.
pub(crate) struct PluginState {
    pub(crate) plugin_id: Uuid,
    /// Block bookkeeping for the kernel memory.
    pub(crate) kernel: Kernel,
    /// Runtime-owned linear memory holding input, output and host blocks.
    pub(crate) memory: Option<Memory>,
    pub(crate) config: BTreeMap<String, String>,
    /// Plugin variables; survive across calls.
    pub(crate) vars: BTreeMap<String, Vec<u8>>,
    pub(crate) max_var_bytes: Option<u64>,
    pub(crate) limiter: TrackingLimiter,
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) host_context: HostContext,
    /// Failure reported by the host function currently executing.
    pub(crate) host_error: Option<String>,
    pub(crate) cancel: Arc<CancelHandle>,
    pub(crate) deadline: Option<Instant>,
}

impl PluginState {
    pub(crate) fn var_bytes(&self) -> u64 {
        self.vars
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}
