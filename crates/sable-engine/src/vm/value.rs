//! Tagged runtime values.
//!
//! A `Value` is a small `Copy` tag union; anything bigger than a machine
//! word lives on the heap behind a `HeapHandle`. Scalar accessors are
//! fail-soft: they return `Option` and leave it to the caller to decide
//! whether a wrong tag is a script error or a VM invariant violation.

use std::fmt;

use crate::vm::heap::HeapHandle;

/// A compiled function value: absolute code address plus calling metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionValue {
    pub addr: u32,
    pub nargs: u8,
    pub flags: u8,
}

impl FunctionValue {
    /// Flag bit set on functions that expect the implicit self argument
    /// (closures and methods).
    pub const FLAG_TAKES_SELF: u8 = 0x01;

    pub fn takes_self(&self) -> bool {
        self.flags & Self::FLAG_TAKES_SELF != 0
    }
}

/// Host function signature. Arguments are copied out of the VM stack before
/// the call, so natives may freely re-enter the VM. `Err` values are thrown
/// as script exceptions.
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, Value>;

/// Bookkeeping stored in the stack slot between a frame's arguments and its
/// locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub return_addr: u32,
    pub caller_base: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Reference to a heap object.
    HeapPtr(HeapHandle),
    /// Reference to a stack slot (absolute index), produced by `LOAD_REF`.
    ValueRef(usize),
    FuncAddr(FunctionValue),
    NativeFunc(NativeFn),
    /// Frame marker separating arguments from locals.
    StackFrame(FrameInfo),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer family widened to i64; loses nothing.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(*v as i64),
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::U8(v) => Some(*v as i64),
            Value::U16(v) => Some(*v as i64),
            Value::U32(v) => Some(*v as i64),
            Value::U64(v) => i64::try_from(*v).ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Any numeric value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_heap(&self) -> Option<HeapHandle> {
        match self {
            Value::HeapPtr(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
        )
    }

    /// Truth value used by conditionals on `any`-typed operands: null and
    /// zero are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::I8(v) => *v != 0,
            Value::I16(v) => *v != 0,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::U8(v) => *v != 0,
            Value::U16(v) => *v != 0,
            Value::U32(v) => *v != 0,
            Value::U64(v) => *v != 0,
            Value::F32(v) => *v != 0.0,
            Value::F64(v) => *v != 0.0,
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) => "int",
            Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) => "uint",
            Value::F32(_) | Value::F64(_) => "float",
            Value::HeapPtr(_) => "object",
            Value::ValueRef(_) => "ref",
            Value::FuncAddr(_) => "function",
            Value::NativeFunc(_) => "native function",
            Value::StackFrame(_) => "frame",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::HeapPtr(h) => write!(f, "<object #{}>", h.0),
            Value::ValueRef(slot) => write!(f, "<ref [{}]>", slot),
            Value::FuncAddr(fv) => write!(f, "<function @{}>", fv.addr),
            Value::NativeFunc(_) => write!(f, "<native function>"),
            Value::StackFrame(_) => write!(f, "<frame>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_family_widens_losslessly() {
        assert_eq!(Value::I8(-5).as_i64(), Some(-5));
        assert_eq!(Value::I16(-300).as_i64(), Some(-300));
        assert_eq!(Value::I32(-5).as_i64(), Some(-5));
        assert_eq!(Value::U8(200).as_i64(), Some(200));
        assert_eq!(Value::U16(60_000).as_i64(), Some(60_000));
        assert_eq!(Value::U32(7).as_i64(), Some(7));
        assert_eq!(Value::U64(u64::MAX).as_i64(), None);
        assert_eq!(Value::I64(3).as_f64(), Some(3.0));
    }

    #[test]
    fn test_accessors_fail_soft() {
        assert_eq!(Value::F64(1.5).as_i64(), None);
        assert_eq!(Value::None.as_f64(), None);
        assert_eq!(Value::I32(1).as_bool(), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::I32(0).is_truthy());
        assert!(!Value::F64(0.0).is_truthy());
        assert!(Value::I32(-1).is_truthy());
        assert!(Value::HeapPtr(HeapHandle(0)).is_truthy());
    }

    #[test]
    fn test_self_flag() {
        let plain = FunctionValue {
            addr: 0,
            nargs: 2,
            flags: 0,
        };
        assert!(!plain.takes_self());
        let method = FunctionValue {
            addr: 0,
            nargs: 3,
            flags: FunctionValue::FLAG_TAKES_SELF,
        };
        assert!(method.takes_self());
    }
}
