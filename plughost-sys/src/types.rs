//! `#[repr(C)]` value types shared with host functions.

/// Length/count type used throughout the C ABI.
pub type Size = u64;

/// Wire tag of a [`Val`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
}

/// Offsets into kernel memory travel as `I64`.
pub const PTR: ValType = ValType::I64;

impl ValType {
    /// Decodes a raw tag. Returns `None` for tags outside the supported set.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ValType::I32),
            1 => Some(ValType::I64),
            2 => Some(ValType::F32),
            3 => Some(ValType::F64),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }

    pub(crate) fn to_wasmtime(self) -> wasmtime::ValType {
        match self {
            ValType::I32 => wasmtime::ValType::I32,
            ValType::I64 => wasmtime::ValType::I64,
            ValType::F32 => wasmtime::ValType::F32,
            ValType::F64 => wasmtime::ValType::F64,
        }
    }
}

impl std::fmt::Display for ValType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of a [`Val`]; the active field is selected by [`Val::t`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union ValUnion {
    pub i32: i32,
    pub i64: i64,
    pub f32: f32,
    pub f64: f64,
}

/// Tagged value passed to and from host functions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Val {
    pub t: ValType,
    pub v: ValUnion,
}

impl Val {
    /// Zero value of the given type.
    pub fn zero(t: ValType) -> Self {
        let v = match t {
            ValType::I32 => ValUnion { i32: 0 },
            ValType::I64 => ValUnion { i64: 0 },
            ValType::F32 => ValUnion { f32: 0.0 },
            ValType::F64 => ValUnion { f64: 0.0 },
        };
        Val { t, v }
    }

    pub(crate) fn from_wasmtime(val: &wasmtime::Val) -> Option<Self> {
        Some(match *val {
            wasmtime::Val::I32(x) => Val {
                t: ValType::I32,
                v: ValUnion { i32: x },
            },
            wasmtime::Val::I64(x) => Val {
                t: ValType::I64,
                v: ValUnion { i64: x },
            },
            wasmtime::Val::F32(bits) => Val {
                t: ValType::F32,
                v: ValUnion {
                    f32: f32::from_bits(bits),
                },
            },
            wasmtime::Val::F64(bits) => Val {
                t: ValType::F64,
                v: ValUnion {
                    f64: f64::from_bits(bits),
                },
            },
            _ => return None,
        })
    }

    pub(crate) fn to_wasmtime(self) -> wasmtime::Val {
        // SAFETY: the tag selects the field that was last written.
        unsafe {
            match self.t {
                ValType::I32 => wasmtime::Val::I32(self.v.i32),
                ValType::I64 => wasmtime::Val::I64(self.v.i64),
                ValType::F32 => wasmtime::Val::F32(self.v.f32.to_bits()),
                ValType::F64 => wasmtime::Val::F64(self.v.f64.to_bits()),
            }
        }
    }
}

impl std::fmt::Debug for Val {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: the tag selects the active field.
        unsafe {
            match self.t {
                ValType::I32 => write!(f, "Val::I32({})", self.v.i32),
                ValType::I64 => write!(f, "Val::I64({})", self.v.i64),
                ValType::F32 => write!(f, "Val::F32({})", self.v.f32),
                ValType::F64 => write!(f, "Val::F64({})", self.v.f64),
            }
        }
    }
}
