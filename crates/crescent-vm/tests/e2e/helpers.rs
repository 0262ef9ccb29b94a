use crescent_core::value::LuaValue;
use crescent_vm::vm::Vm;

/// A VM with the builtin set installed.
pub fn make_vm() -> Vm {
    let mut vm = Vm::new();
    crescent_stdlib::register_all(&mut vm);
    vm
}

/// Compile and execute Lua source, returning the chunk's results and the
/// VM (for string assertions).
pub fn run_lua_vm(source: &str) -> (Vec<LuaValue>, Vm) {
    let mut vm = make_vm();
    let closure = vm
        .load_source(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    let results = vm
        .call_value(closure, &[])
        .unwrap_or_else(|e| panic!("runtime error: {}", e.display(&vm.strings)));
    (results, vm)
}

pub fn run_lua(source: &str) -> Vec<LuaValue> {
    run_lua_vm(source).0
}

/// Compile and execute Lua source, expecting a runtime error; returns
/// its message.
pub fn run_lua_err(source: &str) -> String {
    let mut vm = make_vm();
    let closure = vm
        .load_source(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    match vm.call_value(closure, &[]) {
        Err(e) => e.display(&vm.strings),
        Ok(vals) => panic!("expected error, got {} results: {vals:?}", vals.len()),
    }
}

/// Compile Lua source, expecting a front-end error; returns its message.
pub fn compile_err(source: &str) -> String {
    match crescent_compiler::compile(source.as_bytes(), "=test") {
        Err(e) => format!("{e}"),
        Ok(_) => panic!("expected compile error"),
    }
}

pub fn assert_int(results: &[LuaValue], idx: usize, expected: i64) {
    let val = results[idx];
    let got = val
        .as_integer()
        .unwrap_or_else(|| panic!("result[{idx}] = {val:?}, expected integer {expected}"));
    assert_eq!(got, expected, "result[{idx}]");
}

pub fn assert_float(results: &[LuaValue], idx: usize, expected: f64) {
    let val = results[idx];
    let got = val
        .as_float()
        .unwrap_or_else(|| panic!("result[{idx}] = {val:?}, expected float {expected}"));
    assert!(
        (got - expected).abs() < 1e-10,
        "result[{idx}] = {got}, expected {expected}"
    );
}

pub fn assert_bool(results: &[LuaValue], idx: usize, expected: bool) {
    let val = results[idx];
    let got = val
        .as_boolean()
        .unwrap_or_else(|| panic!("result[{idx}] = {val:?}, expected bool {expected}"));
    assert_eq!(got, expected, "result[{idx}]");
}

pub fn assert_nil(results: &[LuaValue], idx: usize) {
    assert!(
        results[idx].is_nil(),
        "result[{idx}] = {:?}, expected nil",
        results[idx]
    );
}

pub fn assert_str(results: &[LuaValue], idx: usize, expected: &str, vm: &Vm) {
    let val = results[idx];
    let sid = val
        .as_string_id()
        .unwrap_or_else(|| panic!("result[{idx}] = {val:?}, expected string {expected:?}"));
    let got = vm.strings.get_str(sid);
    assert_eq!(got, expected, "result[{idx}]");
}

/// Run source and compare all results against expected integers.
pub fn run_check_ints(source: &str, expected: &[i64]) {
    let results = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}: {results:?}",
        expected.len(),
        results.len()
    );
    for (i, &exp) in expected.iter().enumerate() {
        assert_int(&results, i, exp);
    }
}
