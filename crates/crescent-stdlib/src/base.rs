//! The base builtins: printing, type inspection, metatable access, the
//! iteration protocol, error handling, and the raw table operations.

use crescent_core::value::LuaValue;
use crescent_vm::coerce;
use crescent_vm::error::LuaError;
use crescent_vm::metamethod;
use crescent_vm::vm::{format_value, Vm};

pub fn register(vm: &mut Vm) {
    // `pairs` hands out the registered `next`, and `ipairs` hands out an
    // anonymous iterator; keep both values on the VM.
    let next_val = vm.register_native("next", lua_next);
    vm.next_fn = Some(next_val);
    let ipairs_aux = vm.add_native("ipairs_iterator", lua_ipairs_aux);
    vm.ipairs_aux_fn = Some(ipairs_aux);

    vm.register_native("print", lua_print);
    vm.register_native("type", lua_type);
    vm.register_native("tostring", lua_tostring);
    vm.register_native("tonumber", lua_tonumber);
    vm.register_native("getmetatable", lua_getmetatable);
    vm.register_native("setmetatable", lua_setmetatable);
    vm.register_native("pairs", lua_pairs);
    vm.register_native("ipairs", lua_ipairs);
    vm.register_native("error", lua_error);
    vm.register_native("pcall", lua_pcall);
    vm.register_native("assert", lua_assert);
    vm.register_native("select", lua_select);
    vm.register_native("rawget", lua_rawget);
    vm.register_native("rawset", lua_rawset);
    vm.register_native("rawequal", lua_rawequal);
    vm.register_native("rawlen", lua_rawlen);
    vm.register_native("unpack", lua_unpack);

    // _G refers to the globals table itself.
    let globals = LuaValue::Table(vm.globals);
    vm.set_global("_G", globals);
    let version_id = vm.strings.intern(b"Lua 5.3");
    vm.set_global("_VERSION", LuaValue::Str(version_id));
}

fn arg(args: &[LuaValue], i: usize) -> LuaValue {
    args.get(i).copied().unwrap_or(LuaValue::Nil)
}

fn bad_argument(n: usize, func: &str, expected: &str, got: LuaValue) -> LuaError {
    LuaError::Runtime(format!(
        "bad argument #{n} to '{func}' ({expected} expected, got {})",
        got.type_name()
    ))
}

/// `tostring` semantics with the `__tostring` hook.
fn tostring_value(vm: &mut Vm, v: LuaValue) -> Result<String, LuaError> {
    if let Some(handler) = metamethod::get_metamethod(v, vm.mm.tostring, &vm.gc) {
        let result = vm
            .call_value(handler, &[v])?
            .into_iter()
            .next()
            .unwrap_or(LuaValue::Nil);
        if let Some(id) = result.as_string_id() {
            return Ok(vm.strings.get_str(id).into_owned());
        }
        return Err(LuaError::Runtime(
            "'__tostring' must return a string".to_string(),
        ));
    }
    Ok(format_value(v, &vm.gc, &vm.strings))
}

fn lua_print(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let mut line = String::new();
    for (i, &v) in args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&tostring_value(vm, v)?);
    }
    println!("{line}");
    Ok(vec![])
}

fn lua_type(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    if args.is_empty() {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'type' (value expected)".to_string(),
        ));
    }
    let id = vm.strings.intern(args[0].type_name().as_bytes());
    Ok(vec![LuaValue::Str(id)])
}

fn lua_tostring(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let s = tostring_value(vm, arg(args, 0))?;
    let id = vm.strings.intern(s.as_bytes());
    Ok(vec![LuaValue::Str(id)])
}

fn lua_tonumber(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let v = arg(args, 0);
    match v {
        LuaValue::Integer(_) | LuaValue::Float(_) => Ok(vec![v]),
        LuaValue::Str(id) => {
            let s = vm.strings.get_str(id).into_owned();
            match coerce::parse_number(&s) {
                Some(n) => Ok(vec![n.to_value()]),
                None => Ok(vec![LuaValue::Nil]),
            }
        }
        _ => Ok(vec![LuaValue::Nil]),
    }
}

fn lua_getmetatable(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let v = arg(args, 0);
    let Some(tidx) = v.as_table_idx() else {
        return Ok(vec![LuaValue::Nil]);
    };
    let Some(mt) = vm.gc.get_table(tidx).metatable else {
        return Ok(vec![LuaValue::Nil]);
    };
    // __metatable protection: return the guard value instead.
    let guard = vm.gc.get_table(mt).raw_get_str(vm.mm.metatable);
    if !guard.is_nil() {
        return Ok(vec![guard]);
    }
    Ok(vec![LuaValue::Table(mt)])
}

fn lua_setmetatable(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let mt = arg(args, 1);
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "setmetatable", "table", t));
    };
    if !mt.is_nil() && !mt.is_table() {
        return Err(bad_argument(2, "setmetatable", "nil or table", mt));
    }
    if let Some(old) = vm.gc.get_table(tidx).metatable {
        if !vm.gc.get_table(old).raw_get_str(vm.mm.metatable).is_nil() {
            return Err(LuaError::Runtime(
                "cannot change a protected metatable".to_string(),
            ));
        }
    }
    vm.gc.get_table_mut(tidx).metatable = mt.as_table_idx();
    Ok(vec![t])
}

fn lua_next(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let key = arg(args, 1);
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "next", "table", t));
    };
    match vm.gc.get_table(tidx).next(key) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![LuaValue::Nil]),
        Err(()) => Err(LuaError::Runtime("invalid key to 'next'".to_string())),
    }
}

fn lua_pairs(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    if !t.is_table() {
        return Err(bad_argument(1, "pairs", "table", t));
    }
    let next_fn = vm.next_fn.expect("next registered before pairs");
    Ok(vec![next_fn, t, LuaValue::Nil])
}

fn lua_ipairs(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    if t.is_nil() {
        return Err(bad_argument(1, "ipairs", "table", t));
    }
    let iter = vm.ipairs_aux_fn.expect("ipairs iterator registered");
    Ok(vec![iter, t, LuaValue::Integer(0)])
}

/// Stateless iterator behind `ipairs`: stops at the first nil slot.
fn lua_ipairs_aux(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let i = arg(args, 1)
        .as_integer()
        .ok_or_else(|| bad_argument(2, "ipairs", "number", arg(args, 1)))?;
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "ipairs", "table", t));
    };
    let next_i = i + 1;
    let v = vm.gc.get_table(tidx).raw_geti(next_i);
    if v.is_nil() {
        Ok(vec![LuaValue::Nil])
    } else {
        Ok(vec![LuaValue::Integer(next_i), v])
    }
}

fn lua_error(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let msg = arg(args, 0);
    let level = match arg(args, 1) {
        LuaValue::Nil => 1,
        v => v.as_integer().unwrap_or(1),
    };
    // String messages at level > 0 get a position prefix for the frame
    // that called error().
    if let (Some(id), true) = (msg.as_string_id(), level > 0) {
        if let Some(pos) = vm.position_at_level((level - 1) as usize) {
            let text = format!("{pos}: {}", vm.strings.get_str(id));
            let new_id = vm.strings.intern(text.as_bytes());
            return Err(LuaError::Value(LuaValue::Str(new_id)));
        }
    }
    Err(LuaError::Value(msg))
}

fn lua_pcall(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    if args.is_empty() {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'pcall' (value expected)".to_string(),
        ));
    }
    Ok(vm.pcall_value(args[0], &args[1..]))
}

fn lua_assert(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let v = arg(args, 0);
    if v.is_truthy() {
        return Ok(args.to_vec());
    }
    match args.get(1) {
        Some(&msg) => Err(LuaError::Value(msg)),
        None => {
            let id = vm.strings.intern(b"assertion failed!");
            Err(LuaError::Value(LuaValue::Str(id)))
        }
    }
}

fn lua_select(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let idx = arg(args, 0);
    let rest = &args[1.min(args.len())..];
    if let Some(id) = idx.as_string_id() {
        if vm.strings.get_bytes(id) == b"#" {
            return Ok(vec![LuaValue::Integer(rest.len() as i64)]);
        }
    }
    let n = int_arg(idx).ok_or_else(|| bad_argument(1, "select", "number", idx))?;
    let start = if n < 0 {
        let from_end = rest.len() as i64 + n;
        if from_end < 0 {
            return Err(LuaError::Runtime(
                "bad argument #1 to 'select' (index out of range)".to_string(),
            ));
        }
        from_end as usize
    } else if n == 0 {
        return Err(LuaError::Runtime(
            "bad argument #1 to 'select' (index out of range)".to_string(),
        ));
    } else {
        ((n - 1) as usize).min(rest.len())
    };
    Ok(rest[start..].to_vec())
}

fn lua_rawget(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "rawget", "table", t));
    };
    Ok(vec![vm.gc.get_table(tidx).raw_get(arg(args, 1))])
}

fn lua_rawset(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "rawset", "table", t));
    };
    vm.gc
        .get_table_mut(tidx)
        .raw_set(arg(args, 1), arg(args, 2))
        .map_err(|m| LuaError::Runtime(m.to_string()))?;
    Ok(vec![t])
}

/// `unpack(list [, i [, j]])`: the list's elements from i (default 1)
/// through j (default #list) as multiple return values.
fn lua_unpack(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let t = arg(args, 0);
    let Some(tidx) = t.as_table_idx() else {
        return Err(bad_argument(1, "unpack", "table", t));
    };
    let from = match arg(args, 1) {
        LuaValue::Nil => 1,
        v => int_arg(v).ok_or_else(|| bad_argument(2, "unpack", "number", v))?,
    };
    let to = match arg(args, 2) {
        LuaValue::Nil => vm.gc.get_table(tidx).length(),
        v => int_arg(v).ok_or_else(|| bad_argument(3, "unpack", "number", v))?,
    };
    let count = (to as i128) - (from as i128) + 1;
    if count <= 0 {
        return Ok(vec![]);
    }
    if count > 1_000_000 {
        return Err(LuaError::Runtime("too many results to unpack".to_string()));
    }
    let mut out = Vec::with_capacity(count as usize);
    for k in from..=to {
        out.push(vm.gc.get_table(tidx).raw_geti(k));
    }
    Ok(out)
}

/// Integer argument, accepting integral floats.
fn int_arg(v: LuaValue) -> Option<i64> {
    v.as_integer()
        .or_else(|| v.as_float().and_then(coerce::float_to_integer))
}

fn lua_rawequal(_vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    Ok(vec![LuaValue::Boolean(
        arg(args, 0).raw_equals(&arg(args, 1)),
    )])
}

fn lua_rawlen(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    let v = arg(args, 0);
    if let Some(tidx) = v.as_table_idx() {
        return Ok(vec![LuaValue::Integer(vm.gc.get_table(tidx).length())]);
    }
    if let Some(id) = v.as_string_id() {
        return Ok(vec![LuaValue::Integer(
            vm.strings.get_bytes(id).len() as i64
        )]);
    }
    Err(LuaError::Runtime(
        "table or string expected".to_string(),
    ))
}
