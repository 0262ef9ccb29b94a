use super::helpers::*;

#[test]
fn test_closure_counter() {
    run_check_ints(
        "local function counter()
            local n = 0
            return function()
               n = n + 1
               return n
            end
         end
         local c = counter()
         c()
         c()
         return c()",
        &[3],
    );
}

#[test]
fn test_closure_counter_sequence() {
    // Scenario from the language reference: each call advances the same
    // captured variable, left-to-right evaluation.
    run_check_ints(
        "local function f(x)
            return function() x = x + 1 return x end
         end
         local g = f(0)
         return g(), g(), g()",
        &[1, 2, 3],
    );
}

#[test]
fn test_upvalue_shared_between_closures() {
    run_check_ints(
        "local x = 0
         local function inc() x = x + 1 end
         local function get() return x end
         inc()
         inc()
         inc()
         return get()",
        &[3],
    );
}

#[test]
fn test_upvalue_writes_visible_to_outer_scope() {
    run_check_ints(
        "local x = 1
         local function set(v) x = v end
         set(99)
         return x",
        &[99],
    );
}

#[test]
fn test_upvalue_closed_on_return() {
    run_check_ints(
        "local function make()
            local x = 42
            return function() return x end
         end
         local f = make()
         return f()",
        &[42],
    );
}

#[test]
fn test_closed_upvalue_still_shared() {
    // Both closures outlive the scope; they must keep observing each
    // other's writes through the (single) closed cell.
    run_check_ints(
        "local function make()
            local x = 0
            return function(v) x = v end, function() return x end
         end
         local set, get = make()
         set(7)
         set(21)
         return get()",
        &[21],
    );
}

#[test]
fn test_loop_variable_fresh_per_iteration() {
    run_check_ints(
        "local fns = {}
         for i = 1, 3 do
            fns[i] = function() return i end
         end
         return fns[1](), fns[2](), fns[3]()",
        &[1, 2, 3],
    );
}

#[test]
fn test_while_loop_local_fresh_per_iteration() {
    run_check_ints(
        "local fns = {}
         local n = 0
         while n < 3 do
            n = n + 1
            local v = n * 10
            fns[n] = function() return v end
         end
         return fns[1]() + fns[2]() + fns[3]()",
        &[60],
    );
}

#[test]
fn test_nested_closures() {
    run_check_ints(
        "local function outer()
            local a = 1
            return function()
               local b = 10
               return function() return a + b end
            end
         end
         return outer()()()",
        &[11],
    );
}

#[test]
fn test_upvalue_through_two_levels() {
    run_check_ints(
        "local x = 5
         local function level1()
            local function level2()
               return x
            end
            return level2()
         end
         return level1()",
        &[5],
    );
}

#[test]
fn test_local_function_recursion_via_upvalue() {
    run_check_ints(
        "local function make()
            local function even(n)
               if n == 0 then return 1 end
               return even(n - 2)
            end
            return even
         end
         return make()(10)",
        &[1],
    );
}

#[test]
fn test_parameter_captured() {
    run_check_ints(
        "local function adder(n)
            return function(x) return x + n end
         end
         local add5 = adder(5)
         local add10 = adder(10)
         return add5(1), add10(1)",
        &[6, 11],
    );
}

#[test]
fn test_closure_over_for_in_loop_var() {
    run_check_ints(
        "local fns = {}
         for _, v in ipairs({5, 6}) do
            fns[#fns + 1] = function() return v end
         end
         return fns[1](), fns[2]()",
        &[5, 6],
    );
}
