//! Kernel memory: the runtime-owned linear memory through which input,
//! output, errors and host-allocated blocks are exchanged with the guest.
//!
//! All addressing is by offset into this memory. Offset 0 means "none".
//! The memory may be relocated whenever it grows, so callers never keep a
//! base pointer across an allocation.

use crate::error::Error;
use crate::state::{PAGE_SIZE, PluginState};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::{debug, error, info, trace, warn};
use wasmtime::{AsContext, AsContextMut, Caller, Linker, Memory};

/// First offset handed out; everything below is reserved so 0 stays null.
const BASE_OFFSET: u64 = 8;
const ALIGN: u64 = 8;

#[derive(Debug, Clone, Copy)]
struct Block {
    capacity: u64,
    len: u64,
    free: bool,
}

/// Block bookkeeping for the kernel memory. Reset at the start of every call.
#[derive(Debug)]
pub(crate) struct Kernel {
    blocks: BTreeMap<u64, Block>,
    end: u64,
    pub(crate) input: Option<(u64, u64)>,
    pub(crate) output: Option<(u64, u64)>,
    pub(crate) error: Option<u64>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self {
            blocks: BTreeMap::new(),
            end: BASE_OFFSET,
            input: None,
            output: None,
            error: None,
        }
    }
}

impl Kernel {
    pub(crate) fn reset(&mut self) {
        *self = Kernel::default();
    }

    /// Reuses the first freed block large enough for `len`.
    fn reuse(&mut self, len: u64) -> Option<u64> {
        let (offset, block) = self
            .blocks
            .iter_mut()
            .find(|(_, b)| b.free && b.capacity >= len)?;
        block.free = false;
        block.len = len;
        Some(*offset)
    }

    /// Offset and new end of a fresh block of `len` bytes.
    fn next_range(&self, len: u64) -> Option<(u64, u64)> {
        let capacity = len.max(1).checked_next_multiple_of(ALIGN)?;
        let end = self.end.checked_add(capacity)?;
        Some((self.end, end))
    }

    fn commit(&mut self, offset: u64, len: u64, end: u64) {
        self.blocks.insert(
            offset,
            Block {
                capacity: end - offset,
                len,
                free: false,
            },
        );
        self.end = end;
    }

    /// Length of a live block; 0 when `offset` is not one.
    pub(crate) fn length(&self, offset: u64) -> u64 {
        match self.blocks.get(&offset) {
            Some(b) if !b.free => b.len,
            _ => 0,
        }
    }

    pub(crate) fn free(&mut self, offset: u64) -> bool {
        match self.blocks.get_mut(&offset) {
            Some(b) if !b.free => {
                b.free = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn live_blocks(&self) -> usize {
        self.blocks.values().filter(|b| !b.free).count()
    }
}

fn kernel_memory(ctx: &impl AsContext<Data = PluginState>) -> Result<Memory, Error> {
    ctx.as_context()
        .data()
        .memory
        .ok_or_else(|| Error::Memory("kernel memory not initialized".into()))
}

/// Allocates `len` bytes, growing the memory when needed.
pub(crate) fn alloc(
    ctx: &mut impl AsContextMut<Data = PluginState>,
    len: u64,
) -> Result<u64, Error> {
    let mut store = ctx.as_context_mut();
    if let Some(offset) = store.data_mut().kernel.reuse(len) {
        trace!(offset, len, "Reused kernel block");
        return Ok(offset);
    }
    let memory = kernel_memory(&store)?;
    let (offset, end) = store
        .data()
        .kernel
        .next_range(len)
        .ok_or_else(|| Error::Memory(format!("allocation of {len} bytes overflows")))?;
    let size = memory.data_size(&store) as u64;
    if end > size {
        let pages = (end - size).div_ceil(PAGE_SIZE);
        memory
            .grow(&mut store, pages)
            .map_err(|e| Error::Memory(format!("unable to allocate {len} bytes: {e}")))?;
    }
    store.data_mut().kernel.commit(offset, len, end);
    trace!(offset, len, "Allocated kernel block");
    Ok(offset)
}

/// Allocates a block and fills it with `data`.
pub(crate) fn alloc_bytes(
    ctx: &mut impl AsContextMut<Data = PluginState>,
    data: &[u8],
) -> Result<u64, Error> {
    let offset = alloc(ctx, data.len() as u64)?;
    write(ctx, offset, data)?;
    Ok(offset)
}

/// Bytes `offset..offset + len`, bounds-checked against the memory.
pub(crate) fn bytes<'a, C: AsContext<Data = PluginState>>(
    ctx: &'a C,
    offset: u64,
    len: u64,
) -> Result<&'a [u8], Error> {
    let memory = kernel_memory(ctx)?;
    let data = memory.data(ctx);
    let range = checked_range(offset, len, data.len())?;
    Ok(&data[range])
}

/// Contents of the live block at `offset`.
pub(crate) fn block<'a, C: AsContext<Data = PluginState>>(
    ctx: &'a C,
    offset: u64,
) -> Result<&'a [u8], Error> {
    let len = ctx.as_context().data().kernel.length(offset);
    bytes(ctx, offset, len)
}

pub(crate) fn write(
    ctx: &mut impl AsContextMut<Data = PluginState>,
    offset: u64,
    data: &[u8],
) -> Result<(), Error> {
    let memory = kernel_memory(&*ctx)?;
    let mem = memory.data_mut(ctx);
    let range = checked_range(offset, data.len() as u64, mem.len())?;
    mem[range].copy_from_slice(data);
    Ok(())
}

fn checked_range(offset: u64, len: u64, size: usize) -> Result<std::ops::Range<usize>, Error> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= size as u64)
        .ok_or_else(|| {
            Error::Memory(format!(
                "range {offset}+{len} out of bounds for memory of {size} bytes"
            ))
        })?;
    Ok(offset as usize..end as usize)
}

/// Resets the kernel and copies the call input into a fresh block.
pub(crate) fn set_input(
    ctx: &mut impl AsContextMut<Data = PluginState>,
    input: &[u8],
) -> Result<(), Error> {
    ctx.as_context_mut().data_mut().kernel.reset();
    let offset = if input.is_empty() {
        0
    } else {
        alloc_bytes(ctx, input)?
    };
    ctx.as_context_mut().data_mut().kernel.input = Some((offset, input.len() as u64));
    Ok(())
}

pub(crate) fn output(ctx: &impl AsContext<Data = PluginState>) -> Result<Vec<u8>, Error> {
    match ctx.as_context().data().kernel.output {
        Some((offset, len)) => Ok(bytes(ctx, offset, len)?.to_vec()),
        None => Ok(Vec::new()),
    }
}

/// Error message set by the guest through `extism_error_set`, if any.
pub(crate) fn guest_error(ctx: &impl AsContext<Data = PluginState>) -> Option<String> {
    let offset = ctx.as_context().data().kernel.error?;
    match block(ctx, offset) {
        Ok(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Err(e) => Some(format!("invalid error offset {offset}: {e}")),
    }
}

fn trap(e: impl std::fmt::Display) -> wasmtime::Error {
    wasmtime::Error::msg(e.to_string())
}

fn read_string(caller: &Caller<'_, PluginState>, offset: u64) -> wasmtime::Result<String> {
    let b = block(caller, offset).map_err(trap)?;
    Ok(String::from_utf8_lossy(b).into_owned())
}

fn load<const N: usize>(
    caller: &Caller<'_, PluginState>,
    offset: u64,
) -> wasmtime::Result<[u8; N]> {
    let b = bytes(caller, offset, N as u64).map_err(trap)?;
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Ok(out)
}

fn store(caller: &mut Caller<'_, PluginState>, offset: u64, data: &[u8]) -> wasmtime::Result<()> {
    write(caller, offset, data).map_err(trap)
}

#[derive(Clone, Copy)]
enum GuestLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn guest_log(
    caller: &Caller<'_, PluginState>,
    level: GuestLevel,
    offset: u64,
) -> wasmtime::Result<()> {
    let message = read_string(caller, offset)?;
    let plugin_id = caller.data().plugin_id;
    match level {
        GuestLevel::Debug => debug!(target: "plughost::guest", plugin_id = %plugin_id, "{message}"),
        GuestLevel::Info => info!(target: "plughost::guest", plugin_id = %plugin_id, "{message}"),
        GuestLevel::Warn => warn!(target: "plughost::guest", plugin_id = %plugin_id, "{message}"),
        GuestLevel::Error => error!(target: "plughost::guest", plugin_id = %plugin_id, "{message}"),
    }
    Ok(())
}

fn var_get(mut caller: Caller<'_, PluginState>, key: u64) -> wasmtime::Result<u64> {
    let key = read_string(&caller, key)?;
    let Some(value) = caller.data().vars.get(&key).cloned() else {
        return Ok(0);
    };
    alloc_bytes(&mut caller, &value).map_err(trap)
}

fn var_set(mut caller: Caller<'_, PluginState>, key: u64, value: u64) -> wasmtime::Result<()> {
    let key = read_string(&caller, key)?;
    if value == 0 {
        caller.data_mut().vars.remove(&key);
        return Ok(());
    }
    let value = block(&caller, value).map_err(trap)?.to_vec();
    let state = caller.data_mut();
    let previous = state
        .vars
        .get(&key)
        .map_or(0, |v| (key.len() + v.len()) as u64);
    let projected = state.var_bytes() - previous + (key.len() + value.len()) as u64;
    if let Some(max) = state.max_var_bytes {
        if projected > max {
            return Err(trap(format!(
                "var store limit exceeded: {projected} bytes > {max} bytes"
            )));
        }
    }
    state.vars.insert(key, value);
    Ok(())
}

/// Reads host stdin to its end into a new block. Only fd 0 is readable.
fn file_read(mut caller: Caller<'_, PluginState>, fd: i32) -> wasmtime::Result<u64> {
    if fd != 0 {
        return Err(trap(format!("extism_file_read: unsupported file descriptor {fd}")));
    }
    let mut data = Vec::new();
    std::io::stdin().lock().read_to_end(&mut data).map_err(trap)?;
    if data.is_empty() {
        return Ok(0);
    }
    alloc_bytes(&mut caller, &data).map_err(trap)
}

/// Writes a block to host stdout (fd 1) or stderr (fd 2).
fn file_write(caller: Caller<'_, PluginState>, fd: i32, offset: u64) -> wasmtime::Result<()> {
    let data = block(&caller, offset).map_err(trap)?;
    let written = match fd {
        1 => {
            let mut out = std::io::stdout().lock();
            out.write_all(data).and_then(|()| out.flush())
        }
        2 => std::io::stderr().lock().write_all(data),
        _ => {
            return Err(trap(format!("extism_file_write: unsupported file descriptor {fd}")));
        }
    };
    written.map_err(trap)
}

/// Links the kernel imports into the `env` namespace.
pub(crate) fn add_to_linker(linker: &mut Linker<PluginState>) -> Result<(), Error> {
    linker.func_wrap("env", "extism_input_offset", |caller: Caller<'_, PluginState>| {
        caller.data().kernel.input.map_or(0, |(offset, _)| offset)
    })?;
    linker.func_wrap("env", "extism_input_length", |caller: Caller<'_, PluginState>| {
        caller.data().kernel.input.map_or(0, |(_, len)| len)
    })?;
    linker.func_wrap(
        "env",
        "extism_length",
        |caller: Caller<'_, PluginState>, offset: u64| caller.data().kernel.length(offset),
    )?;
    linker.func_wrap(
        "env",
        "extism_alloc",
        |mut caller: Caller<'_, PluginState>, len: u64| -> wasmtime::Result<u64> {
            alloc(&mut caller, len).map_err(trap)
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_free",
        |mut caller: Caller<'_, PluginState>, offset: u64| {
            caller.data_mut().kernel.free(offset);
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_output_set",
        |mut caller: Caller<'_, PluginState>, offset: u64, len: u64| -> wasmtime::Result<()> {
            bytes(&caller, offset, len).map_err(trap)?;
            caller.data_mut().kernel.output = Some((offset, len));
            Ok(())
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_error_set",
        |mut caller: Caller<'_, PluginState>, offset: u64| {
            caller.data_mut().kernel.error = (offset != 0).then_some(offset);
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_config_get",
        |mut caller: Caller<'_, PluginState>, key: u64| -> wasmtime::Result<u64> {
            let key = read_string(&caller, key)?;
            let Some(value) = caller.data().config.get(&key).cloned() else {
                return Ok(0);
            };
            alloc_bytes(&mut caller, value.as_bytes()).map_err(trap)
        },
    )?;
    for name in ["extism_var_get", "extism_kv_get"] {
        linker.func_wrap("env", name, var_get)?;
    }
    for name in ["extism_var_set", "extism_kv_set"] {
        linker.func_wrap("env", name, var_set)?;
    }
    linker.func_wrap(
        "env",
        "extism_load_u8",
        |caller: Caller<'_, PluginState>, offset: u64| -> wasmtime::Result<u32> {
            Ok(load::<1>(&caller, offset)?[0] as u32)
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_store_u8",
        |mut caller: Caller<'_, PluginState>, offset: u64, value: u32| -> wasmtime::Result<()> {
            store(&mut caller, offset, &[value as u8])
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_load_u32",
        |caller: Caller<'_, PluginState>, offset: u64| -> wasmtime::Result<u32> {
            Ok(u32::from_le_bytes(load::<4>(&caller, offset)?))
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_store_u32",
        |mut caller: Caller<'_, PluginState>, offset: u64, value: u32| -> wasmtime::Result<()> {
            store(&mut caller, offset, &value.to_le_bytes())
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_load_u64",
        |caller: Caller<'_, PluginState>, offset: u64| -> wasmtime::Result<u64> {
            Ok(u64::from_le_bytes(load::<8>(&caller, offset)?))
        },
    )?;
    linker.func_wrap(
        "env",
        "extism_store_u64",
        |mut caller: Caller<'_, PluginState>, offset: u64, value: u64| -> wasmtime::Result<()> {
            store(&mut caller, offset, &value.to_le_bytes())
        },
    )?;
    linker.func_wrap("env", "extism_file_read", file_read)?;
    linker.func_wrap("env", "extism_file_write", file_write)?;
    for (name, level) in [
        ("extism_log_debug", GuestLevel::Debug),
        ("extism_log_info", GuestLevel::Info),
        ("extism_log_warn", GuestLevel::Warn),
        ("extism_log_error", GuestLevel::Error),
    ] {
        linker.func_wrap(
            "env",
            name,
            move |caller: Caller<'_, PluginState>, offset: u64| guest_log(&caller, level, offset),
        )?;
    }
    Ok(())
}
