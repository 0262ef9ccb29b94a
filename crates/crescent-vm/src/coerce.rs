//! Type coercion helpers: string/number conversions and Lua's number
//! formatting rules.

use crescent_core::string::{StringId, StringInterner};
use crescent_core::value::LuaValue;

/// A number after coercion, preserving the integer/float subtype.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    pub fn to_value(self) -> LuaValue {
        match self {
            Number::Int(i) => LuaValue::Integer(i),
            Number::Float(f) => LuaValue::Float(f),
        }
    }
}

/// Coerce a value to a number for arithmetic: numbers pass through,
/// numeral strings parse with their subtype.
pub fn to_number(v: LuaValue, strings: &StringInterner) -> Option<Number> {
    match v {
        LuaValue::Integer(i) => Some(Number::Int(i)),
        LuaValue::Float(f) => Some(Number::Float(f)),
        LuaValue::Str(id) => {
            let s = std::str::from_utf8(strings.get_bytes(id)).ok()?;
            parse_number(s)
        }
        _ => None,
    }
}

/// Coerce a value to an integer (for bitwise operations and the like):
/// integers pass, integral floats convert, numeral strings parse then
/// convert.
pub fn to_integer(v: LuaValue, strings: &StringInterner) -> Option<i64> {
    match to_number(v, strings)? {
        Number::Int(i) => Some(i),
        Number::Float(f) => float_to_integer(f),
    }
}

/// Exact float-to-integer conversion; None when the float has a
/// fractional part or is out of range.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if !f.is_finite() || f.floor() != f {
        return None;
    }
    // i64::MIN is exactly representable; 2^63 (= -(i64::MIN as f64)) is
    // the first unrepresentable value on the positive side.
    const IMIN: f64 = i64::MIN as f64;
    const IMAX_P1: f64 = -(i64::MIN as f64);
    if !(IMIN..IMAX_P1).contains(&f) {
        return None;
    }
    Some(f as i64)
}

/// Parse a Lua numeral from a string: decimal or hex, integer or float.
/// Rejects "inf"/"nan" (Rust accepts them, Lua does not).
pub fn parse_number(s: &str) -> Option<Number> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let unsigned = t.strip_prefix(['-', '+']).unwrap_or(t);
    if unsigned.starts_with("0x") || unsigned.starts_with("0X") {
        if unsigned.contains(['.', 'p', 'P']) {
            return crescent_compiler::lexer::parse_hex_float(t).map(Number::Float);
        }
        return parse_hex_integer(t).map(Number::Int);
    }
    if let Ok(i) = t.parse::<i64>() {
        return Some(Number::Int(i));
    }
    let lower = unsigned.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    t.parse::<f64>().ok().map(Number::Float)
}

/// Hex integers wrap modulo 2^64, matching the lexer and PUC Lua.
fn parse_hex_integer(s: &str) -> Option<i64> {
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let hex = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    if hex.is_empty() {
        return None;
    }
    let mut val: u64 = 0;
    for c in hex.chars() {
        let digit = c.to_digit(16)? as u64;
        val = val.wrapping_mul(16).wrapping_add(digit);
    }
    let result = val as i64;
    Some(if neg { result.wrapping_neg() } else { result })
}

/// String form of a value for concatenation: strings pass, numbers
/// format; everything else needs `__concat`.
pub fn to_string_for_concat(v: LuaValue, strings: &mut StringInterner) -> Option<StringId> {
    match v {
        LuaValue::Str(id) => Some(id),
        LuaValue::Integer(i) => Some(strings.intern(i.to_string().as_bytes())),
        LuaValue::Float(f) => Some(strings.intern(lua_format_float(f).as_bytes())),
        _ => None,
    }
}

/// Format a float the way Lua 5.3 prints it (`%.14g`, with a trailing
/// `.0` for integral values so the subtype stays visible).
pub fn lua_format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    format_g14(f)
}

/// `%.14g` for a finite float.
fn format_g14(f: f64) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if (-4..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, f);
        if s.contains('.') {
            let trimmed = s.trim_end_matches('0');
            if trimmed.ends_with('.') {
                format!("{trimmed}0")
            } else {
                trimmed.to_string()
            }
        } else {
            s
        }
    } else {
        let s = format!("{:.13e}", f);
        fix_scientific_notation(&s)
    }
}

/// Rust prints `1.23e5`; C's printf prints `1.23e+05`. Match C, and trim
/// trailing mantissa zeros.
fn fix_scientific_notation(s: &str) -> String {
    let Some(e_pos) = s.find('e') else {
        return s.to_string();
    };
    let mantissa = &s[..e_pos];
    let exp_str = &s[e_pos + 1..];
    let (sign, digits) = match exp_str.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("+", exp_str.strip_prefix('+').unwrap_or(exp_str)),
    };
    let exp_num: i32 = digits.parse().unwrap_or(0);
    let mantissa = if mantissa.contains('.') {
        let t = mantissa.trim_end_matches('0');
        if t.ends_with('.') {
            format!("{t}0")
        } else {
            t.to_string()
        }
    } else {
        mantissa.to_string()
    };
    format!("{mantissa}e{sign}{:02}", exp_num.abs())
}
