use super::helpers::*;

#[test]
fn test_pcall_success() {
    let r = run_lua("return pcall(function() return 1, 2 end)");
    assert_bool(&r, 0, true);
    assert_int(&r, 1, 1);
    assert_int(&r, 2, 2);
}

#[test]
fn test_pcall_catches_error() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function() error('boom') end)
         return ok, err",
    );
    assert_bool(&r, 0, false);
    let sid = r[1].as_string_id().expect("error message is a string");
    let msg = vm.strings.get_str(sid);
    // error() prefixes the raiser's position.
    assert!(msg.contains("boom"), "{msg}");
    assert!(msg.contains("test:1"), "{msg}");
}

#[test]
fn test_error_position_prefix_format() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function()
            error('mid')
         end)
         return err",
    );
    let sid = r[0].as_string_id().unwrap();
    let msg = vm.strings.get_str(sid);
    assert!(msg.contains("test:2: mid"), "{msg}");
}

#[test]
fn test_error_level_zero_no_prefix() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function() error('raw', 0) end)
         return err",
    );
    assert_str(&r, 0, "raw", &vm);
}

#[test]
fn test_error_with_table_value() {
    run_check_ints(
        "local ok, err = pcall(function() error({code = 42}) end)
         return ok and 1 or 0, err.code",
        &[0, 42],
    );
}

#[test]
fn test_pcall_catches_runtime_fault() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function() return nil + 1 end)
         return ok, err",
    );
    assert_bool(&r, 0, false);
    let sid = r[1].as_string_id().unwrap();
    let msg = vm.strings.get_str(sid);
    assert!(msg.contains("attempt to perform arithmetic"), "{msg}");
}

#[test]
fn test_pcall_returns_passthrough_values() {
    run_check_ints(
        "local function ret(a, b) return a + b end
         local ok, v = pcall(ret, 20, 22)
         return ok and 1 or 0, v",
        &[1, 42],
    );
}

#[test]
fn test_nested_pcall() {
    run_check_ints(
        "local ok1 = pcall(function()
            local ok2, err2 = pcall(function() error('inner') end)
            if ok2 then error('inner escaped') end
            error('outer')
         end)
         return ok1 and 1 or 0",
        &[0],
    );
}

#[test]
fn test_execution_continues_after_pcall() {
    run_check_ints(
        "local n = 0
         pcall(function() n = 1 error('x') n = 99 end)
         n = n + 10
         return n",
        &[11],
    );
}

#[test]
fn test_pcall_non_function() {
    let r = run_lua("return pcall(42)");
    assert_bool(&r, 0, false);
}

#[test]
fn test_pcall_callable_table() {
    run_check_ints(
        "local t = setmetatable({}, {__call = function() return 7 end})
         local ok, v = pcall(t)
         return ok and 1 or 0, v",
        &[1, 7],
    );
}

#[test]
fn test_assert_passes_values_through() {
    run_check_ints("return assert(1, 2, 3)", &[1, 2, 3]);
}

#[test]
fn test_assert_failure() {
    let e = run_lua_err("assert(false)");
    assert!(e.contains("assertion failed!"), "{e}");
    let e = run_lua_err("assert(nil, 'custom message')");
    assert!(e.contains("custom message"), "{e}");
}

#[test]
fn test_runtime_error_has_position() {
    let e = run_lua_err("local x\nreturn x.field");
    assert!(e.contains("test:2"), "{e}");
    assert!(e.contains("attempt to index a nil value"), "{e}");
}

#[test]
fn test_upvalues_closed_during_unwind() {
    // The closure captures a local from the failing function; unwinding
    // must close it so the captured value survives.
    run_check_ints(
        "local captured
         pcall(function()
            local x = 42
            captured = function() return x end
            error('unwind')
         end)
         return captured()",
        &[42],
    );
}

#[test]
fn test_stack_overflow_is_catchable() {
    run_check_ints(
        "local function f() return 1 + f() end
         local ok, err = pcall(f)
         return ok and 1 or 0",
        &[0],
    );
}

#[test]
fn test_error_rethrow() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function()
            local ok2, inner = pcall(function() error('deep') end)
            error(inner, 0)
         end)
         return err",
    );
    let sid = r[0].as_string_id().unwrap();
    let msg = vm.strings.get_str(sid);
    assert!(msg.contains("deep"), "{msg}");
}
