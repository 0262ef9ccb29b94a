//! Compile → dump → undump → execute round trips, and the reference
//! scenarios from the language description.

use super::helpers::*;
use crescent_vm::binary_chunk;
use crescent_vm::vm::Vm;

/// Compile source, serialize it, reload the binary chunk in a fresh VM,
/// and run it there.
fn run_via_binary(source: &str) -> (Vec<crescent_core::value::LuaValue>, Vm) {
    let (proto, strings) =
        crescent_compiler::compile(source.as_bytes(), "@chunk.lua").expect("compiles");
    let bytes = binary_chunk::dump(&proto, &strings, false);

    let mut vm = make_vm();
    let closure = vm.load_binary(&bytes, "@chunk.lua").expect("loads");
    let results = vm
        .call_value(closure, &[])
        .unwrap_or_else(|e| panic!("runtime error: {}", e.display(&vm.strings)));
    (results, vm)
}

#[test]
fn test_roundtrip_simple_program() {
    let (r, _) = run_via_binary("return 1 + 2");
    assert_int(&r, 0, 3);
}

#[test]
fn test_roundtrip_structural_equality() {
    let source = "local function f(a, b)
            local t = {a, b, x = 'str'}
            for i = 1, 3 do t[#t + 1] = i * 1.5 end
            return t
         end
         return f(1, 2)";
    let (proto, strings) = crescent_compiler::compile(source.as_bytes(), "@rt.lua").unwrap();
    let bytes = binary_chunk::dump(&proto, &strings, false);
    let mut strings2 = strings;
    let restored = binary_chunk::undump(&bytes, "@rt.lua", &mut strings2).unwrap();
    assert_eq!(restored, proto);
}

#[test]
fn test_roundtrip_closures_and_upvalues() {
    let (r, _) = run_via_binary(
        "local function counter()
            local n = 0
            return function() n = n + 1 return n end
         end
         local c = counter()
         c() c()
         return c()",
    );
    assert_int(&r, 0, 3);
}

#[test]
fn test_roundtrip_stripped_still_runs() {
    let (proto, strings) = crescent_compiler::compile(
        b"local x = 10 return x * 2",
        "@s.lua",
    )
    .unwrap();
    let bytes = binary_chunk::dump(&proto, &strings, true);
    let mut vm = make_vm();
    let closure = vm.load_binary(&bytes, "@s.lua").unwrap();
    let r = vm.call_value(closure, &[]).unwrap();
    assert_int(&r, 0, 20);
}

#[test]
fn test_binary_chunk_detected_by_signature() {
    let (proto, strings) = crescent_compiler::compile(b"return 7", "@x.lua").unwrap();
    let bytes = binary_chunk::dump(&proto, &strings, false);
    assert!(bytes.starts_with(binary_chunk::LUA_SIGNATURE));
}

#[test]
fn test_load_rejects_bad_chunk() {
    let mut vm = make_vm();
    let err = vm.load_binary(b"\x1bLua\x52junk", "@bad.luac").unwrap_err();
    assert!(err.message.contains("version mismatch"), "{}", err.message);
}

// ---- Reference scenarios ----

#[test]
fn test_scenario_print_arithmetic() {
    // print(1+2) writes "3\n"; the value itself:
    run_check_ints("return 1+2", &[3]);
}

#[test]
fn test_scenario_table_len_and_index() {
    run_check_ints("local t = {10, 20, 30} return #t, t[2]", &[3, 20]);
}

#[test]
fn test_scenario_closure_counter() {
    run_check_ints(
        "local function f(x) return function() x = x + 1 return x end end
         local g = f(0)
         return g(), g(), g()",
        &[1, 2, 3],
    );
}

#[test]
fn test_scenario_pcall_error() {
    let (r, vm) = run_lua_vm(
        "local ok, err = pcall(function() error('boom') end)
         return ok, err",
    );
    assert_bool(&r, 0, false);
    let msg = vm
        .strings
        .get_str(r[1].as_string_id().unwrap())
        .into_owned();
    assert!(msg.ends_with("boom"), "{msg}");
    assert!(msg.contains(':'), "{msg}");
}

#[test]
fn test_scenario_add_metamethod() {
    let (r, vm) = run_lua_vm(
        "local mt = {__add = function(a, b) return 'X' end}
         local a = setmetatable({}, mt)
         return a + 1",
    );
    assert_str(&r, 0, "X", &vm);
}

#[test]
fn test_scenario_numeric_for() {
    run_check_ints(
        "local out = {}
         for i = 1, 3 do out[#out + 1] = i end
         return out[1], out[2], out[3]",
        &[1, 2, 3],
    );
}

#[test]
fn test_print_does_not_error() {
    // Smoke test for the print path (output goes to stdout).
    run_lua("print(1 + 2) print('a', 1, nil, true)");
}

#[test]
fn test_gc_survives_heavy_allocation() {
    // Enough garbage to force several collections mid-run; live data
    // must survive them.
    run_check_ints(
        "local keep = {}
         for i = 1, 2000 do
            local tmp = {i, i + 1, pad = {}}
            if i % 100 == 0 then keep[#keep + 1] = tmp end
         end
         local sum = 0
         for _, t in ipairs(keep) do sum = sum + t[1] end
         return #keep, sum",
        &[20, 21000],
    );
}

#[test]
fn test_gc_preserves_cycles_reachable_from_globals() {
    run_check_ints(
        "a = {}
         b = {back = a}
         a.fwd = b
         for i = 1, 1000 do local _ = {i} end
         return a.fwd.back == a and 1 or 0",
        &[1],
    );
}
