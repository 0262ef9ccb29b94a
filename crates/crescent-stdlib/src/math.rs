//! Minimal `math` table: the integer-range constants plus a few basics.

use crescent_core::value::LuaValue;
use crescent_vm::coerce;
use crescent_vm::error::LuaError;
use crescent_vm::vm::Vm;

pub fn register(vm: &mut Vm) {
    let floor = vm.add_native("floor", lua_floor);
    let ceil = vm.add_native("ceil", lua_ceil);
    let abs = vm.add_native("abs", lua_abs);

    let math = vm.gc.alloc_table(0, 8);
    let entries: &[(&[u8], LuaValue)] = &[
        (b"maxinteger", LuaValue::Integer(i64::MAX)),
        (b"mininteger", LuaValue::Integer(i64::MIN)),
        (b"huge", LuaValue::Float(f64::INFINITY)),
        (b"pi", LuaValue::Float(std::f64::consts::PI)),
        (b"floor", floor),
        (b"ceil", ceil),
        (b"abs", abs),
    ];
    for (name, val) in entries {
        let key = vm.strings.intern(name);
        vm.gc.get_table_mut(math).raw_set_str(key, *val);
    }
    vm.set_global("math", LuaValue::Table(math));
}

fn number_arg(vm: &Vm, args: &[LuaValue], n: usize, func: &str) -> Result<LuaValue, LuaError> {
    let v = args.get(n).copied().unwrap_or(LuaValue::Nil);
    match coerce::to_number(v, &vm.strings) {
        Some(num) => Ok(num.to_value()),
        None => Err(LuaError::Runtime(format!(
            "bad argument #{} to '{func}' (number expected, got {})",
            n + 1,
            v.type_name()
        ))),
    }
}

fn lua_floor(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    match number_arg(vm, args, 0, "floor")? {
        LuaValue::Integer(i) => Ok(vec![LuaValue::Integer(i)]),
        LuaValue::Float(f) => {
            let fl = f.floor();
            Ok(vec![match coerce::float_to_integer(fl) {
                Some(i) => LuaValue::Integer(i),
                None => LuaValue::Float(fl),
            }])
        }
        _ => unreachable!(),
    }
}

fn lua_ceil(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    match number_arg(vm, args, 0, "ceil")? {
        LuaValue::Integer(i) => Ok(vec![LuaValue::Integer(i)]),
        LuaValue::Float(f) => {
            let c = f.ceil();
            Ok(vec![match coerce::float_to_integer(c) {
                Some(i) => LuaValue::Integer(i),
                None => LuaValue::Float(c),
            }])
        }
        _ => unreachable!(),
    }
}

fn lua_abs(vm: &mut Vm, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
    match number_arg(vm, args, 0, "abs")? {
        LuaValue::Integer(i) => Ok(vec![LuaValue::Integer(i.wrapping_abs())]),
        LuaValue::Float(f) => Ok(vec![LuaValue::Float(f.abs())]),
        _ => unreachable!(),
    }
}
