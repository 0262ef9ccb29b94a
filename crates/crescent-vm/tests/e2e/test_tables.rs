use super::helpers::*;

#[test]
fn test_constructor_and_index() {
    run_check_ints("local t = {10, 20, 30} return #t, t[2]", &[3, 20]);
}

#[test]
fn test_constructor_mixed_fields() {
    run_check_ints(
        "local t = {1, x = 10, 2, [100] = 20, 3}
         return t[1], t[2], t[3], t.x, t[100]",
        &[1, 2, 3, 10, 20],
    );
}

#[test]
fn test_constructor_with_call_tail() {
    run_check_ints(
        "local function three() return 7, 8, 9 end
         local t = {1, three()}
         return #t, t[2], t[4]",
        &[4, 7, 9],
    );
}

#[test]
fn test_constructor_call_mid_list_truncates() {
    run_check_ints(
        "local function three() return 7, 8, 9 end
         local t = {three(), 100}
         return #t, t[1], t[2]",
        &[2, 7, 100],
    );
}

#[test]
fn test_large_constructor_setlist_batches() {
    // More than one SETLIST batch (50 entries each).
    let source = {
        let items: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
        format!(
            "local t = {{{}}} return #t, t[1], t[50], t[51], t[120]",
            items.join(", ")
        )
    };
    run_check_ints(&source, &[120, 1, 50, 51, 120]);
}

#[test]
fn test_assignment_and_growth() {
    run_check_ints(
        "local t = {}
         for i = 1, 10 do t[i] = i * i end
         return #t, t[5]",
        &[10, 25],
    );
}

#[test]
fn test_out_of_order_insertion_migrates() {
    run_check_ints(
        "local t = {}
         t[3] = 30
         t[1] = 10
         t[2] = 20
         return #t, t[3]",
        &[3, 30],
    );
}

#[test]
fn test_nil_assignment_deletes() {
    run_check_ints(
        "local t = {x = 1}
         t.x = nil
         return t.x == nil and 1 or 0",
        &[1],
    );
}

#[test]
fn test_length_border_after_trailing_nil() {
    run_check_ints(
        "local t = {1, 2, 3, 4, 5}
         t[5] = nil
         t[4] = nil
         return #t",
        &[3],
    );
}

#[test]
fn test_nested_tables() {
    run_check_ints(
        "local t = {a = {b = {c = 42}}}
         return t.a.b.c",
        &[42],
    );
}

#[test]
fn test_table_keys_by_type() {
    run_check_ints(
        "local t = {}
         t[1] = 10
         t['1'] = 20
         t[1.0] = 30         -- same slot as t[1]
         t[true] = 40
         return t[1], t['1'], t[true]",
        &[30, 20, 40],
    );
}

#[test]
fn test_table_identity_keys() {
    run_check_ints(
        "local k1, k2 = {}, {}
         local t = {}
         t[k1] = 1
         t[k2] = 2
         return t[k1], t[k2]",
        &[1, 2],
    );
}

#[test]
fn test_nil_index_errors() {
    let e = run_lua_err("local t = {} t[nil] = 1");
    assert!(e.contains("table index is nil"), "{e}");
}

#[test]
fn test_nan_index_errors() {
    let e = run_lua_err("local t = {} t[0/0] = 1");
    assert!(e.contains("table index is NaN"), "{e}");
}

#[test]
fn test_index_nil_errors() {
    let e = run_lua_err("local t return t.x");
    assert!(e.contains("attempt to index a nil value"), "{e}");
}

#[test]
fn test_next_iteration() {
    run_check_ints(
        "local t = {10, 20, x = 30}
         local count, sum = 0, 0
         local k, v = next(t)
         while k ~= nil do
            count = count + 1
            sum = sum + v
            k, v = next(t, k)
         end
         return count, sum",
        &[3, 60],
    );
}

#[test]
fn test_next_empty_table() {
    let r = run_lua("return next({})");
    assert_nil(&r, 0);
}

#[test]
fn test_pairs_with_delete_during_iteration() {
    // Deleting the current key while iterating is allowed.
    run_check_ints(
        "local t = {a = 1, b = 2, c = 3}
         for k in pairs(t) do t[k] = nil end
         return next(t) == nil and 1 or 0",
        &[1],
    );
}

#[test]
fn test_ipairs_stops_at_hole() {
    run_check_ints(
        "local t = {1, 2, nil, 4}
         local count = 0
         for _ in ipairs(t) do count = count + 1 end
         return count",
        &[2],
    );
}

#[test]
fn test_rawget_rawset() {
    run_check_ints(
        "local t = setmetatable({}, {
            __index = function() return 99 end,
            __newindex = function() error('no') end,
         })
         rawset(t, 'x', 1)
         return rawget(t, 'x'), rawget(t, 'y') == nil and 1 or 0, t.y",
        &[1, 1, 99],
    );
}

#[test]
fn test_rawequal_rawlen() {
    run_check_ints(
        "local t = {1, 2, 3}
         local u = t
         return rawequal(t, u) and 1 or 0, rawequal(t, {}) and 1 or 0, rawlen(t)",
        &[1, 0, 3],
    );
}

#[test]
fn test_multiple_assignment_through_tables() {
    run_check_ints(
        "local t = {}
         t.a, t.b = 1, 2
         t.a, t.b = t.b, t.a
         return t.a, t.b",
        &[2, 1],
    );
}
