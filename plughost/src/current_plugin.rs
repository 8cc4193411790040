//! The call context handed to host functions.

use plughost_sys as sys;
use std::any::Any;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// The plugin instance currently calling into a host function.
///
/// Only valid for one host-function invocation; the lifetime keeps it from
/// escaping the callback. Memory access lives in [`crate::memory`].
pub struct CurrentPlugin<'a> {
    raw: NonNull<sys::CurrentPlugin<'static>>,
    _call: PhantomData<&'a mut ()>,
}

impl<'a> CurrentPlugin<'a> {
    /// # Safety
    /// `raw` must be the context pointer of a host-function invocation that
    /// outlives `'a`.
    pub(crate) unsafe fn from_raw(raw: *mut sys::CurrentPlugin<'_>) -> Option<Self> {
        NonNull::new(raw.cast::<sys::CurrentPlugin<'static>>()).map(|raw| Self {
            raw,
            _call: PhantomData,
        })
    }

    pub(crate) fn as_raw(&self) -> *mut sys::CurrentPlugin<'static> {
        self.raw.as_ptr()
    }

    /// The host context of the in-flight call, if the caller passed one of
    /// type `T`.
    pub fn host_context<T: Any>(&mut self) -> Option<&mut T> {
        let ptr = unsafe { sys::plughost_current_plugin_host_context(self.as_raw()) };
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the binding only ever installs a pointer to a live
        // `&mut dyn Any` owned by the blocked caller of this call.
        let slot = unsafe { &mut *ptr.cast::<&mut dyn Any>() };
        (**slot).downcast_mut::<T>()
    }

    /// Marks the invocation as failed; the guest traps with `message`.
    pub(crate) fn set_error(&mut self, message: &str) {
        unsafe {
            sys::plughost_current_plugin_set_error(
                self.as_raw(),
                message.as_ptr(),
                message.len() as sys::Size,
            )
        };
    }
}
