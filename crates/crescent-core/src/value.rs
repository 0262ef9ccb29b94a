/// Runtime Lua value representation.
///
/// A `LuaValue` is a tagged union: nil, booleans, and both numeric subtypes
/// are stored inline; strings, tables, and functions are handles into the
/// string interner or the GC heap. The whole value is 16 bytes and `Copy`,
/// so register moves are plain assignments.
use crate::gc::{GcIdx, LuaClosure};
use crate::string::StringId;
use crate::table::Table;
use std::fmt;

/// Handle to a host function registered on the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// A Lua value.
#[derive(Clone, Copy, Debug)]
pub enum LuaValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(StringId),
    Table(GcIdx<Table>),
    Function(GcIdx<LuaClosure>),
    Native(NativeId),
}

impl LuaValue {
    // ---- Type checks ----

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Integer(_) | LuaValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::Str(_))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    /// Returns true for both Lua closures and native functions.
    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::Function(_) | LuaValue::Native(_))
    }

    // ---- Extractors ----

    #[inline]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Numeric value as f64 (integers widen). No string coercion here.
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            LuaValue::Str(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table_idx(&self) -> Option<GcIdx<Table>> {
        match self {
            LuaValue::Table(idx) => Some(*idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_closure_idx(&self) -> Option<GcIdx<LuaClosure>> {
        match self {
            LuaValue::Function(idx) => Some(*idx),
            _ => None,
        }
    }

    // ---- Lua semantics ----

    /// Lua falsy: only nil and false.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    /// The name `type()` reports for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Integer(_) | LuaValue::Float(_) => "number",
            LuaValue::Str(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) | LuaValue::Native(_) => "function",
        }
    }

    /// Raw (metamethod-free) equality.
    ///
    /// Integer/float pairs compare by numeric value; strings compare by id
    /// (the interner dedups all lengths, so id equality is byte equality);
    /// tables and functions compare by identity.
    pub fn raw_equals(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Integer(i), LuaValue::Float(f))
            | (LuaValue::Float(f), LuaValue::Integer(i)) => int_eq_float(*i, *f),
            (LuaValue::Str(a), LuaValue::Str(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Native(a), LuaValue::Native(b)) => a == b,
            _ => false,
        }
    }
}

/// i == f under Lua's rules: the float must be integral and represent
/// exactly the same mathematical value.
#[inline]
pub fn int_eq_float(i: i64, f: f64) -> bool {
    // 2^63 is the first value of i64 range that f64 cannot hold exactly on
    // the positive side; comparing through f64 is exact inside (-2^63, 2^63).
    f.floor() == f && f >= -(2f64.powi(63)) && f < 2f64.powi(63) && (f as i64) == i
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equals(other)
    }
}

impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Integer(i) => write!(f, "{i}"),
            LuaValue::Float(x) => write!(f, "{x}"),
            LuaValue::Str(id) => write!(f, "string(#{})", id.0),
            LuaValue::Table(idx) => write!(f, "table: 0x{:08x}", idx.index()),
            LuaValue::Function(idx) => write!(f, "function: 0x{:08x}", idx.index()),
            LuaValue::Native(id) => write!(f, "function: builtin#{}", id.0),
        }
    }
}
