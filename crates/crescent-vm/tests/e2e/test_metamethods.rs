use super::helpers::*;

#[test]
fn test_add_metamethod() {
    let (r, vm) = run_lua_vm(
        "local mt = {__add = function(a, b) return 'X' end}
         local a = setmetatable({}, mt)
         return a + 1",
    );
    assert_str(&r, 0, "X", &vm);
}

#[test]
fn test_add_metamethod_receives_operands() {
    run_check_ints(
        "local mt = {__add = function(a, b) return a.n + b end}
         local a = setmetatable({n = 40}, mt)
         return a + 2, 2 + a",
        &[42, 42],
    );
}

#[test]
fn test_arith_metamethods() {
    run_check_ints(
        "local mt = {
            __sub = function() return 1 end,
            __mul = function() return 2 end,
            __div = function() return 3 end,
            __mod = function() return 4 end,
            __pow = function() return 5 end,
            __idiv = function() return 6 end,
            __unm = function() return 7 end,
         }
         local a = setmetatable({}, mt)
         return a - 1, a * 1, a / 1, a % 1, a ^ 1, a // 1, -a",
        &[1, 2, 3, 4, 5, 6, 7],
    );
}

#[test]
fn test_bitwise_metamethods() {
    run_check_ints(
        "local mt = {
            __band = function() return 1 end,
            __bor = function() return 2 end,
            __bxor = function() return 3 end,
            __shl = function() return 4 end,
            __shr = function() return 5 end,
            __bnot = function() return 6 end,
         }
         local a = setmetatable({}, mt)
         return a & 1, a | 1, a ~ 1, a << 1, a >> 1, ~a",
        &[1, 2, 3, 4, 5, 6],
    );
}

#[test]
fn test_index_function() {
    run_check_ints(
        "local t = setmetatable({}, {
            __index = function(tbl, key) return key * 2 end,
         })
         return t[21]",
        &[42],
    );
}

#[test]
fn test_index_table_chain() {
    run_check_ints(
        "local base = {x = 1}
         local mid = setmetatable({y = 2}, {__index = base})
         local top = setmetatable({z = 3}, {__index = mid})
         return top.x, top.y, top.z",
        &[1, 2, 3],
    );
}

#[test]
fn test_index_raw_hit_skips_metamethod() {
    run_check_ints(
        "local t = setmetatable({x = 5}, {
            __index = function() return 99 end,
         })
         return t.x",
        &[5],
    );
}

#[test]
fn test_newindex_function() {
    run_check_ints(
        "local log = {}
         local t = setmetatable({}, {
            __newindex = function(tbl, k, v) log[#log + 1] = v end,
         })
         t.a = 10
         t.b = 20
         return #log, log[1], log[2], rawget(t, 'a') == nil and 1 or 0",
        &[2, 10, 20, 1],
    );
}

#[test]
fn test_newindex_table_redirect() {
    run_check_ints(
        "local store = {}
         local t = setmetatable({}, {__newindex = store})
         t.x = 42
         return store.x, rawget(t, 'x') == nil and 1 or 0",
        &[42, 1],
    );
}

#[test]
fn test_newindex_skipped_for_existing_key() {
    run_check_ints(
        "local t = setmetatable({x = 1}, {
            __newindex = function() error('should not run') end,
         })
         t.x = 2
         return t.x",
        &[2],
    );
}

#[test]
fn test_eq_metamethod() {
    let r = run_lua(
        "local mt = {__eq = function(a, b) return a.id == b.id end}
         local a = setmetatable({id = 1}, mt)
         local b = setmetatable({id = 1}, mt)
         local c = setmetatable({id = 2}, mt)
         return a == b, a == c, a ~= c",
    );
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, false);
    assert_bool(&r, 2, true);
}

#[test]
fn test_eq_not_called_when_raw_equal() {
    run_check_ints(
        "local calls = 0
         local mt = {__eq = function() calls = calls + 1 return true end}
         local a = setmetatable({}, mt)
         local _ = a == a
         return calls",
        &[0],
    );
}

#[test]
fn test_eq_not_called_for_mixed_types() {
    let r = run_lua(
        "local mt = {__eq = function() return true end}
         local a = setmetatable({}, mt)
         return a == 1",
    );
    assert_bool(&r, 0, false);
}

#[test]
fn test_lt_le_metamethods() {
    let r = run_lua(
        "local mt = {
            __lt = function(a, b) return a.v < b.v end,
            __le = function(a, b) return a.v <= b.v end,
         }
         local a = setmetatable({v = 1}, mt)
         local b = setmetatable({v = 2}, mt)
         return a < b, b < a, a <= b, a > b",
    );
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, false);
    assert_bool(&r, 2, true);
    assert_bool(&r, 3, false);
}

#[test]
fn test_le_falls_back_to_lt() {
    // Without __le, `a <= b` uses not (b < a).
    let r = run_lua(
        "local mt = {__lt = function(a, b) return a.v < b.v end}
         local a = setmetatable({v = 1}, mt)
         local b = setmetatable({v = 2}, mt)
         return a <= b, b <= a",
    );
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, false);
}

#[test]
fn test_call_metamethod() {
    run_check_ints(
        "local t = setmetatable({base = 10}, {
            __call = function(self, x) return self.base + x end,
         })
         return t(32)",
        &[42],
    );
}

#[test]
fn test_len_metamethod() {
    run_check_ints(
        "local t = setmetatable({1, 2, 3}, {__len = function() return 99 end})
         return #t",
        &[99],
    );
}

#[test]
fn test_concat_metamethod() {
    let (r, vm) = run_lua_vm(
        "local mt = {__concat = function(a, b) return 'C' end}
         local t = setmetatable({}, mt)
         return t .. 'x', 'x' .. t",
    );
    assert_str(&r, 0, "C", &vm);
    assert_str(&r, 1, "C", &vm);
}

#[test]
fn test_tostring_metamethod() {
    let (r, vm) = run_lua_vm(
        "local t = setmetatable({}, {__tostring = function() return 'CUSTOM' end})
         return tostring(t)",
    );
    assert_str(&r, 0, "CUSTOM", &vm);
}

#[test]
fn test_metatable_protection() {
    let (r, vm) = run_lua_vm(
        "local t = setmetatable({}, {__metatable = 'locked'})
         return getmetatable(t)",
    );
    assert_str(&r, 0, "locked", &vm);

    let e = run_lua_err(
        "local t = setmetatable({}, {__metatable = 'locked'})
         setmetatable(t, {})",
    );
    assert!(e.contains("cannot change a protected metatable"), "{e}");
}

#[test]
fn test_getmetatable_plain() {
    run_check_ints(
        "local mt = {}
         local t = setmetatable({}, mt)
         return getmetatable(t) == mt and 1 or 0,
                getmetatable({}) == nil and 1 or 0,
                getmetatable(1) == nil and 1 or 0",
        &[1, 1, 1],
    );
}

#[test]
fn test_setmetatable_requires_table() {
    let e = run_lua_err("setmetatable(1, {})");
    assert!(e.contains("bad argument"), "{e}");
}

#[test]
fn test_remove_metatable() {
    run_check_ints(
        "local t = setmetatable({}, {__index = function() return 5 end})
         setmetatable(t, nil)
         return t.x == nil and 1 or 0",
        &[1],
    );
}

#[test]
fn test_self_method_through_index() {
    run_check_ints(
        "local proto = {}
         function proto:get() return self.v end
         local obj = setmetatable({v = 7}, {__index = proto})
         return obj:get()",
        &[7],
    );
}
