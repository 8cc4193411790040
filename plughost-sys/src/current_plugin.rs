//! Call context handed to host functions.

use crate::error::Error;
use crate::kernel;
use crate::state::PluginState;
use std::ffi::c_void;
use wasmtime::Caller;

/// The in-flight plugin instance during a host-function invocation.
///
/// Only ever handed out by pointer for the duration of one host call; the
/// pointer is dangling as soon as the callback returns.
pub struct CurrentPlugin<'a> {
    caller: Caller<'a, PluginState>,
}

impl<'a> CurrentPlugin<'a> {
    pub(crate) fn new(caller: Caller<'a, PluginState>) -> Self {
        Self { caller }
    }

    pub(crate) fn memory_base(&mut self) -> *mut u8 {
        match self.caller.data().memory {
            Some(memory) => memory.data_ptr(&self.caller),
            None => std::ptr::null_mut(),
        }
    }

    pub(crate) fn memory_size(&self) -> u64 {
        self.caller
            .data()
            .memory
            .map_or(0, |memory| memory.data_size(&self.caller) as u64)
    }

    pub(crate) fn block_len(&self, offset: u64) -> u64 {
        self.caller.data().kernel.length(offset)
    }

    pub(crate) fn alloc(&mut self, len: u64) -> Result<u64, Error> {
        kernel::alloc(&mut self.caller, len)
    }

    pub(crate) fn free(&mut self, offset: u64) -> bool {
        self.caller.data_mut().kernel.free(offset)
    }

    pub(crate) fn host_context(&self) -> *mut c_void {
        self.caller.data().host_context.0
    }

    pub(crate) fn set_error(&mut self, message: String) {
        self.caller.data_mut().host_error = Some(message);
    }

    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.caller.data_mut().host_error.take()
    }
}
