//! Caller-side cancellation.

use plughost_sys as sys;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

type Observer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, Observer)>>,
}

/// A one-shot cancellation signal shared between the caller and whoever may
/// cancel its work.
#[derive(Clone, Default)]
pub struct CancelSignal {
    state: Arc<SignalState>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Fires the signal. Registered observers run once, on this thread.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let observers = std::mem::take(
            &mut *self
                .state
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(observers = observers.len(), "Cancel signal fired");
        for (_, observer) in observers {
            observer();
        }
    }

    /// Runs `f` when the signal fires, or immediately if it already has.
    /// The registration lasts until the returned guard is dropped.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> CancelGuard {
        let mut observers = self
            .state
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(observers);
            f();
            return CancelGuard { registration: None };
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        observers.push((id, Box::new(f)));
        CancelGuard {
            registration: Some((Arc::clone(&self.state), id)),
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Unregisters an observer on drop.
#[must_use = "the observer is removed as soon as the guard is dropped"]
pub struct CancelGuard {
    registration: Option<(Arc<SignalState>, u64)>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some((state, id)) = self.registration.take() {
            state
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(registered, _)| *registered != id);
        }
    }
}

struct HandleState {
    raw: *const sys::CancelHandle,
    released: Mutex<bool>,
}

// SAFETY: the runtime's cancel handle is an atomic flag, and `released`
// serializes every use of `raw` against the owning plugin being freed.
unsafe impl Send for HandleState {}
unsafe impl Sync for HandleState {}

/// Interrupts whatever call is running on one plugin. Cancelling after the
/// plugin is disposed does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<HandleState>,
}

impl CancelHandle {
    pub(crate) fn new(raw: *const sys::CancelHandle) -> Self {
        Self {
            state: Arc::new(HandleState {
                raw,
                released: Mutex::new(raw.is_null()),
            }),
        }
    }

    /// Returns whether the request reached a live plugin.
    pub fn cancel(&self) -> bool {
        let released = self
            .state
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *released {
            return false;
        }
        unsafe { sys::plughost_plugin_cancel(self.state.raw) }
    }

    /// Detaches from the plugin. Blocks until an in-progress `cancel` returns.
    pub(crate) fn release(&self) {
        *self
            .state
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}
