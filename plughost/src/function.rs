//! Host functions: Rust closures the guest can import.
//!
//! A [`Function`] owns its boxed closure through the runtime: the closure is
//! handed over as the native function's user data and released by the
//! runtime once neither the function nor any plugin linked against it is
//! alive.

use crate::current_plugin::CurrentPlugin;
use crate::error::{Error, Result};
use crate::val::{Val, ValType, ValueKind};
use plughost_sys as sys;
use std::ffi::{CString, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

type Callback = dyn Fn(&mut CurrentPlugin<'_>, &[Val], &mut [Val]) -> Result<()> + Send + Sync;

/// Persistent state shared by every invocation of a host function.
pub struct UserData<T>(Arc<Mutex<T>>);

impl<T> UserData<T> {
    pub fn new(value: T) -> Self {
        UserData(Arc::new(Mutex::new(value)))
    }

    /// Locks the data. A panic in an earlier holder does not make the data
    /// unreachable.
    pub fn get(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for UserData<T> {
    fn clone(&self) -> Self {
        UserData(Arc::clone(&self.0))
    }
}

impl<T: Default> Default for UserData<T> {
    fn default() -> Self {
        UserData::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for UserData<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserData").field(&*self.get()).finish()
    }
}

struct Registered {
    raw: NonNull<sys::Function>,
    name: String,
    namespace: String,
    params: Vec<ValType>,
    results: Vec<ValType>,
}

// SAFETY: the descriptor is immutable once shared, and the closure it points
// to is `Send + Sync`.
unsafe impl Send for Registered {}
unsafe impl Sync for Registered {}

impl Drop for Registered {
    fn drop(&mut self) {
        debug!(function = %self.name, "Releasing host function");
        unsafe { sys::plughost_function_free(self.raw.as_ptr()) };
    }
}

/// A registered host function. Cloning shares the registration.
#[derive(Clone)]
pub struct Function {
    inner: Arc<Registered>,
}

impl Function {
    /// Registers `f` under `name` in the `env` namespace.
    pub fn new<T, F>(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = ValType>,
        outputs: impl IntoIterator<Item = ValType>,
        user_data: UserData<T>,
        f: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: Fn(&mut CurrentPlugin<'_>, &[Val], &mut [Val], UserData<T>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        let callback: Box<Callback> = Box::new(move |plugin, inputs, outputs| {
            f(plugin, inputs, outputs, user_data.clone())
        });
        Self::register(
            name.into(),
            inputs.into_iter().collect(),
            outputs.into_iter().collect(),
            callback,
        )
    }

    /// Registers a closure over plain values, e.g. `|a: i64, b: i64| a + b`.
    /// Signatures are derived from the closure's argument and return types.
    pub fn typed<Args, R, F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: TypedHostFn<Args, R>,
    {
        let params = F::params();
        let results = F::results();
        let callback: Box<Callback> = Box::new(move |_, inputs, outputs| f.invoke(inputs, outputs));
        Self::register(name.into(), params, results, callback)
    }

    fn register(
        name: String,
        params: Vec<ValType>,
        results: Vec<ValType>,
        callback: Box<Callback>,
    ) -> Result<Self> {
        let c_name = CString::new(name.as_str())?;
        let user_data = Box::into_raw(Box::new(callback));
        let raw = unsafe {
            sys::plughost_function_new(
                c_name.as_ptr(),
                params.as_ptr(),
                params.len() as sys::Size,
                results.as_ptr(),
                results.len() as sys::Size,
                trampoline,
                user_data.cast(),
                Some(free_callback),
            )
        };
        let Some(raw) = NonNull::new(raw) else {
            // The runtime never took ownership.
            drop(unsafe { Box::from_raw(user_data) });
            return Err(Error::host(format!("unable to register host function '{name}'")));
        };
        debug!(
            function = %name,
            params = params.len(),
            results = results.len(),
            "Registered host function"
        );
        Ok(Self {
            inner: Arc::new(Registered {
                raw,
                name,
                namespace: "env".to_string(),
                params,
                results,
            }),
        })
    }

    /// Moves the import into another module namespace. Must be called before
    /// the function is cloned or used to build plugins.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let c_namespace = CString::new(namespace.as_str())?;
        let Some(inner) = Arc::get_mut(&mut self.inner) else {
            return Err(Error::host(format!(
                "namespace of '{}' cannot change once the function is shared",
                self.inner.name
            )));
        };
        unsafe { sys::plughost_function_set_namespace(inner.raw.as_ptr(), c_namespace.as_ptr()) };
        inner.namespace = namespace;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn params(&self) -> &[ValType] {
        &self.inner.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.inner.results
    }

    pub(crate) fn as_raw(&self) -> *const sys::Function {
        self.inner.raw.as_ptr()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("namespace", &self.namespace())
            .field("params", &self.params())
            .field("results", &self.results())
            .finish()
    }
}

unsafe extern "C" fn free_callback(user_data: *mut c_void) {
    drop(unsafe { Box::from_raw(user_data.cast::<Box<Callback>>()) });
}

unsafe extern "C" fn trampoline(
    plugin: *mut sys::CurrentPlugin<'_>,
    inputs: *const sys::Val,
    n_inputs: sys::Size,
    outputs: *mut sys::Val,
    n_outputs: sys::Size,
    user_data: *mut c_void,
) {
    let Some(mut current) = (unsafe { CurrentPlugin::from_raw(plugin) }) else {
        return;
    };
    // SAFETY: `user_data` is the `Box<Callback>` installed in `register`, kept
    // alive by the runtime for as long as this function can be invoked.
    let callback = unsafe { &*user_data.cast::<Box<Callback>>() };
    // SAFETY: `Val` is `repr(transparent)` over the runtime's value, and the
    // runtime passes exactly `n` initialized values per buffer.
    let inputs: &[Val] = if inputs.is_null() || n_inputs == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(inputs.cast::<Val>(), n_inputs as usize) }
    };
    let outputs: &mut [Val] = if outputs.is_null() || n_outputs == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(outputs.cast::<Val>(), n_outputs as usize) }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut current, inputs, outputs)));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(error = %reason, "Host function panicked");
            format!("host function panicked: {reason}")
        }
    };
    current.set_error(&message);
}

// ================================================================
// Typed closures
// ================================================================

/// Return types accepted by [`Function::typed`].
pub trait HostReturn {
    const TAGS: &'static [ValType];

    fn write(self, outputs: &mut [Val]) -> Result<()>;
}

impl HostReturn for () {
    const TAGS: &'static [ValType] = &[];

    fn write(self, _: &mut [Val]) -> Result<()> {
        Ok(())
    }
}

impl HostReturn for Result<()> {
    const TAGS: &'static [ValType] = &[];

    fn write(self, _: &mut [Val]) -> Result<()> {
        self
    }
}

fn write_single<T: ValueKind>(value: T, outputs: &mut [Val]) -> Result<()> {
    let slot = outputs
        .first_mut()
        .ok_or_else(|| Error::host("host function has no output slot"))?;
    slot.set(value);
    Ok(())
}

macro_rules! host_return {
    ($($ty:ty),*) => {
        $(
            impl HostReturn for $ty {
                const TAGS: &'static [ValType] = &[<$ty as ValueKind>::TAG];

                fn write(self, outputs: &mut [Val]) -> Result<()> {
                    write_single(self, outputs)
                }
            }

            impl HostReturn for Result<$ty> {
                const TAGS: &'static [ValType] = &[<$ty as ValueKind>::TAG];

                fn write(self, outputs: &mut [Val]) -> Result<()> {
                    write_single(self?, outputs)
                }
            }
        )*
    };
}

host_return!(i32, u32, i64, u64, f32, f64);

/// Closures usable with [`Function::typed`]: up to three [`ValueKind`]
/// arguments and a [`HostReturn`].
pub trait TypedHostFn<Args, R>: Send + Sync + 'static {
    fn params() -> Vec<ValType>;

    fn results() -> Vec<ValType>;

    fn invoke(&self, inputs: &[Val], outputs: &mut [Val]) -> Result<()>;
}

fn next_arg<'v>(args: &mut std::slice::Iter<'v, Val>) -> Result<&'v Val> {
    args.next()
        .ok_or_else(|| Error::host("host function received too few arguments"))
}

macro_rules! typed_host_fn {
    ($($arg:ident),*) => {
        impl<Func, R, $($arg,)*> TypedHostFn<($($arg,)*), R> for Func
        where
            Func: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: HostReturn,
            $($arg: ValueKind,)*
        {
            fn params() -> Vec<ValType> {
                vec![$(<$arg as ValueKind>::TAG),*]
            }

            fn results() -> Vec<ValType> {
                R::TAGS.to_vec()
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, inputs: &[Val], outputs: &mut [Val]) -> Result<()> {
                let mut args = inputs.iter();
                $(let $arg: $arg = next_arg(&mut args)?.get()?;)*
                (self)($($arg),*).write(outputs)
            }
        }
    };
}

typed_host_fn!();
typed_host_fn!(A);
typed_host_fn!(A, B);
typed_host_fn!(A, B, C);
