//! Typed values crossing the guest/host boundary.
//!
//! [`ValueKind`] maps the supported Rust scalars onto wire tags at compile
//! time. Unsigned kinds share the slot of their signed counterpart and are
//! bit-reinterpreted, so `u32::MAX` survives a round trip.

use crate::error::{Error, Result};
use plughost_sys as sys;

pub use sys::{PTR, ValType};

mod private {
    pub trait Sealed {}
}

/// A Rust scalar with a wire representation.
pub trait ValueKind: private::Sealed + Copy + Send + 'static {
    const TAG: ValType;

    #[doc(hidden)]
    fn into_union(self) -> sys::ValUnion;

    /// # Safety
    /// The field selected by `Self::TAG` must be the one last written.
    #[doc(hidden)]
    unsafe fn from_union(raw: sys::ValUnion) -> Self;
}

macro_rules! value_kind {
    ($ty:ty, $tag:ident, $field:ident, $slot:ty) => {
        impl private::Sealed for $ty {}

        impl ValueKind for $ty {
            const TAG: ValType = ValType::$tag;

            fn into_union(self) -> sys::ValUnion {
                sys::ValUnion {
                    $field: self as $slot,
                }
            }

            unsafe fn from_union(raw: sys::ValUnion) -> Self {
                unsafe { raw.$field as $ty }
            }
        }
    };
}

value_kind!(i32, I32, i32, i32);
value_kind!(u32, I32, i32, i32);
value_kind!(i64, I64, i64, i64);
value_kind!(u64, I64, i64, i64);
value_kind!(f32, F32, f32, f32);
value_kind!(f64, F64, f64, f64);

/// Wire tag of `T`.
pub const fn tag_of<T: ValueKind>() -> ValType {
    T::TAG
}

/// Decodes a raw wire tag.
pub fn decode_tag(raw: u32) -> Result<ValType> {
    ValType::from_raw(raw).ok_or(Error::UnsupportedType(raw))
}

/// A tagged value. Layout-compatible with the runtime's `Val`.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Val(sys::Val);

impl Val {
    pub fn new<T: ValueKind>(value: T) -> Self {
        Val(sys::Val {
            t: T::TAG,
            v: value.into_union(),
        })
    }

    pub fn zero(ty: ValType) -> Self {
        Val(sys::Val::zero(ty))
    }

    pub fn ty(&self) -> ValType {
        self.0.t
    }

    /// Extracts the payload as `T`; fails unless the tag is exactly `T::TAG`.
    pub fn get<T: ValueKind>(&self) -> Result<T> {
        if self.0.t != T::TAG {
            return Err(Error::TypeMismatch {
                expected: T::TAG,
                actual: self.0.t,
            });
        }
        // SAFETY: the tag matches, so the field `T` reads is the active one.
        Ok(unsafe { T::from_union(self.0.v) })
    }

    /// Replaces tag and payload.
    pub fn set<T: ValueKind>(&mut self, value: T) {
        *self = Val::new(value);
    }
}

/// Free-function form of [`Val::get`].
pub fn read_typed<T: ValueKind>(val: &Val) -> Result<T> {
    val.get()
}

/// Free-function form of [`Val::set`].
pub fn write_typed<T: ValueKind>(val: &mut Val, value: T) {
    val.set(value)
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        if self.ty() != other.ty() {
            return false;
        }
        // SAFETY: both tags are equal and select the active field.
        unsafe {
            match self.ty() {
                ValType::I32 => self.0.v.i32 == other.0.v.i32,
                ValType::I64 => self.0.v.i64 == other.0.v.i64,
                ValType::F32 => self.0.v.f32.to_bits() == other.0.v.f32.to_bits(),
                ValType::F64 => self.0.v.f64.to_bits() == other.0.v.f64.to_bits(),
            }
        }
    }
}

impl std::fmt::Debug for Val {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

macro_rules! val_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Val {
            fn from(value: $ty) -> Self {
                Val::new(value)
            }
        })*
    };
}

val_from!(i32, u32, i64, u64, f32, f64);
