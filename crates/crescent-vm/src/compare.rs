//! Raw comparison operations. Metamethod fallbacks live in dispatch.

use crescent_core::string::StringInterner;
use crescent_core::value::{int_eq_float, LuaValue};

/// Raw equality: numbers across subtypes, strings by content (= by id),
/// reference values by identity. Never consults metamethods.
pub fn raw_eq(a: LuaValue, b: LuaValue) -> bool {
    a.raw_equals(&b)
}

/// Outcome of a primitive ordering attempt.
pub enum CompareResult {
    Ok(bool),
    /// Not comparable without a metamethod.
    NeedMetamethod,
}

/// `a < b` over numbers (across subtypes) and strings (byte order).
pub fn raw_lt(a: LuaValue, b: LuaValue, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => CompareResult::Ok(x < y),
        (LuaValue::Float(x), LuaValue::Float(y)) => CompareResult::Ok(x < y),
        (LuaValue::Integer(x), LuaValue::Float(y)) => CompareResult::Ok((x as f64) < y),
        (LuaValue::Float(x), LuaValue::Integer(y)) => CompareResult::Ok(x < (y as f64)),
        (LuaValue::Str(x), LuaValue::Str(y)) => {
            CompareResult::Ok(strings.get_bytes(x) < strings.get_bytes(y))
        }
        _ => CompareResult::NeedMetamethod,
    }
}

/// `a <= b` over numbers and strings.
pub fn raw_le(a: LuaValue, b: LuaValue, strings: &StringInterner) -> CompareResult {
    match (a, b) {
        (LuaValue::Integer(x), LuaValue::Integer(y)) => CompareResult::Ok(x <= y),
        (LuaValue::Float(x), LuaValue::Float(y)) => CompareResult::Ok(x <= y),
        (LuaValue::Integer(x), LuaValue::Float(y)) => CompareResult::Ok((x as f64) <= y),
        (LuaValue::Float(x), LuaValue::Integer(y)) => CompareResult::Ok(x <= (y as f64)),
        (LuaValue::Str(x), LuaValue::Str(y)) => {
            CompareResult::Ok(strings.get_bytes(x) <= strings.get_bytes(y))
        }
        _ => CompareResult::NeedMetamethod,
    }
}
