//! Guest memory access from inside host functions.
//!
//! Everything is addressed by offset into the runtime-managed memory. The
//! base pointer is looked up again on every access because any allocation
//! may move the memory.

use crate::current_plugin::CurrentPlugin;
use crate::error::{Error, Result};
use plughost_sys as sys;

impl CurrentPlugin<'_> {
    /// Total size of the memory in bytes.
    pub fn memory_len(&self) -> u64 {
        unsafe { sys::plughost_current_plugin_memory_size(self.as_raw()) }
    }

    /// Length of the live block at `offset`; 0 for unknown or freed offsets.
    pub fn block_len(&self, offset: u64) -> u64 {
        unsafe { sys::plughost_current_plugin_memory_length(self.as_raw(), offset) }
    }

    pub fn alloc(&mut self, len: u64) -> Result<u64> {
        match unsafe { sys::plughost_current_plugin_memory_alloc(self.as_raw(), len) } {
            0 => Err(Error::Allocation { len }),
            offset => Ok(offset),
        }
    }

    /// Allocates a block holding a copy of `data`.
    pub fn alloc_bytes(&mut self, data: impl AsRef<[u8]>) -> Result<u64> {
        let data = data.as_ref();
        let offset = self.alloc(data.len() as u64)?;
        self.write_bytes(offset, data)?;
        Ok(offset)
    }

    pub fn free(&mut self, offset: u64) {
        unsafe { sys::plughost_current_plugin_memory_free(self.as_raw(), offset) }
    }

    /// Contents of the block at `offset`. Empty for unknown offsets.
    pub fn read_bytes(&self, offset: u64) -> Result<&[u8]> {
        let len = self.block_len(offset);
        if len == 0 {
            return Ok(&[]);
        }
        let base = self.base()?;
        // SAFETY: live blocks lie within the memory, and the view borrows
        // `self`, so no allocation can move the memory while it exists.
        Ok(unsafe { std::slice::from_raw_parts(base.add(offset as usize), len as usize) })
    }

    /// Like [`CurrentPlugin::read_bytes`], decoded as UTF-8.
    pub fn read_str(&self, offset: u64) -> Result<&str> {
        std::str::from_utf8(self.read_bytes(offset)?)
            .map_err(|e| Error::InvalidString(e.to_string()))
    }

    /// Copies `data` into the block at `offset`. Nothing is written when
    /// the block is too small.
    pub fn write_bytes(&mut self, offset: u64, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let capacity = self.block_len(offset);
        if data.len() as u64 > capacity {
            return Err(Error::DestinationTooSmall {
                len: data.len() as u64,
                capacity,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let base = self.base()?;
        // SAFETY: `offset..offset + data.len()` lies within a live block.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset as usize), data.len())
        };
        Ok(())
    }

    fn base(&self) -> Result<*mut u8> {
        let base = unsafe { sys::plughost_current_plugin_memory(self.as_raw()) };
        if base.is_null() {
            return Err(Error::host("plugin memory is not available"));
        }
        Ok(base)
    }
}
