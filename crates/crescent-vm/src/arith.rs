//! Arithmetic with Lua 5.3 semantics: integer/float subtypes, wrapping
//! integer math, floor division and modulo, full-width shifts.

use crate::coerce::{self, Number};
use crate::error::LuaError;
use crescent_core::string::StringInterner;
use crescent_core::value::LuaValue;

/// Outcome of a primitive operation attempt.
pub enum ArithResult {
    Ok(LuaValue),
    /// Operands are not numbers (or not integers for bitwise ops):
    /// dispatch should try a metamethod.
    NeedMetamethod,
    /// A real fault (division by zero, no integer representation).
    Error(LuaError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }

    /// The metamethod event name, without the leading `__`.
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::BAnd => "band",
            ArithOp::BOr => "bor",
            ArithOp::BXor => "bxor",
            ArithOp::Shl => "shl",
            ArithOp::Shr => "shr",
        }
    }
}

/// Binary arithmetic. `+ - * %` and `//` stay integer when both operands
/// are integers; `/` and `^` always produce floats; bitwise ops demand
/// exact integer representations.
pub fn arith_op(op: ArithOp, a: LuaValue, b: LuaValue, strings: &StringInterner) -> ArithResult {
    if op.is_bitwise() {
        return bitwise_op(op, a, b, strings);
    }

    let (na, nb) = match (coerce::to_number(a, strings), coerce::to_number(b, strings)) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return ArithResult::NeedMetamethod,
    };

    // / and ^ are float operations regardless of subtype.
    if matches!(op, ArithOp::Div | ArithOp::Pow) {
        let result = float_arith(op, na.as_f64(), nb.as_f64());
        return ArithResult::Ok(LuaValue::Float(result));
    }

    match (na, nb) {
        (Number::Int(ia), Number::Int(ib)) => match int_arith(op, ia, ib) {
            Ok(v) => ArithResult::Ok(v),
            Err(e) => ArithResult::Error(e),
        },
        _ => ArithResult::Ok(LuaValue::Float(float_arith(op, na.as_f64(), nb.as_f64()))),
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<LuaValue, LuaError> {
    let result = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return Err(LuaError::Runtime(
                    "attempt to perform 'n//0'".to_string(),
                ));
            }
            lua_idiv(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(LuaError::Runtime("attempt to perform 'n%0'".to_string()));
            }
            lua_imod(a, b)
        }
        _ => unreachable!("handled elsewhere"),
    };
    Ok(LuaValue::Integer(result))
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        // Float floor-division and modulo by zero follow IEEE 754.
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => lua_fmod(a, b),
        _ => unreachable!("bitwise ops never reach the float path"),
    }
}

fn bitwise_op(op: ArithOp, a: LuaValue, b: LuaValue, strings: &StringInterner) -> ArithResult {
    let ia = match coerce::to_integer(a, strings) {
        Some(i) => i,
        None => {
            // A float with a fractional part is a hard error; other
            // types get a chance at a metamethod.
            if a.as_float().is_some() {
                return ArithResult::Error(LuaError::Runtime(
                    "number has no integer representation".to_string(),
                ));
            }
            return ArithResult::NeedMetamethod;
        }
    };
    let ib = match coerce::to_integer(b, strings) {
        Some(i) => i,
        None => {
            if b.as_float().is_some() {
                return ArithResult::Error(LuaError::Runtime(
                    "number has no integer representation".to_string(),
                ));
            }
            return ArithResult::NeedMetamethod;
        }
    };
    let result = match op {
        ArithOp::BAnd => ia & ib,
        ArithOp::BOr => ia | ib,
        ArithOp::BXor => ia ^ ib,
        ArithOp::Shl => lua_shl(ia, ib),
        ArithOp::Shr => lua_shr(ia, ib),
        _ => unreachable!(),
    };
    ArithResult::Ok(LuaValue::Integer(result))
}

/// Floor division, rounding toward negative infinity.
/// `i64::MIN // -1` wraps like PUC Lua.
fn lua_idiv(a: i64, b: i64) -> i64 {
    let d = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        d - 1
    } else {
        d
    }
}

/// Integer modulo with the sign of the divisor: a - floor(a/b)*b.
fn lua_imod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Float modulo with the divisor's sign. Sign comparison instead of
/// multiplying avoids underflow with tiny operands.
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r > 0.0) != (b > 0.0) {
        r + b
    } else {
        r
    }
}

/// Left shift: shifts of 64 or more produce 0, negative counts reverse.
fn lua_shl(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b < 0 {
        lua_shr(a, -b)
    } else {
        ((a as u64) << b) as i64
    }
}

/// Logical (unsigned) right shift.
fn lua_shr(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b < 0 {
        lua_shl(a, -b)
    } else {
        ((a as u64) >> b) as i64
    }
}

/// Unary minus.
pub fn arith_unm(v: LuaValue, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(Number::Int(i)) => ArithResult::Ok(LuaValue::Integer(i.wrapping_neg())),
        Some(Number::Float(f)) => ArithResult::Ok(LuaValue::Float(-f)),
        None => ArithResult::NeedMetamethod,
    }
}

/// Bitwise NOT.
pub fn arith_bnot(v: LuaValue, strings: &StringInterner) -> ArithResult {
    match coerce::to_integer(v, strings) {
        Some(i) => ArithResult::Ok(LuaValue::Integer(!i)),
        None => {
            if v.as_float().is_some() {
                ArithResult::Error(LuaError::Runtime(
                    "number has no integer representation".to_string(),
                ))
            } else {
                ArithResult::NeedMetamethod
            }
        }
    }
}
