use super::helpers::*;

#[test]
fn test_simple_call() {
    run_check_ints(
        "local function add(a, b) return a + b end
         return add(2, 3)",
        &[5],
    );
}

#[test]
fn test_recursion() {
    run_check_ints(
        "local function fact(n)
            if n <= 1 then return 1 end
            return n * fact(n - 1)
         end
         return fact(10)",
        &[3628800],
    );
}

#[test]
fn test_fibonacci() {
    run_check_ints(
        "local function fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
         end
         return fib(15)",
        &[610],
    );
}

#[test]
fn test_multiple_returns() {
    run_check_ints(
        "local function three() return 1, 2, 3 end
         local a, b, c = three()
         return a, b, c",
        &[1, 2, 3],
    );
}

#[test]
fn test_multiple_returns_truncated_mid_list() {
    run_check_ints(
        "local function three() return 1, 2, 3 end
         local a, b = three(), 10
         return a, b",
        &[1, 10],
    );
}

#[test]
fn test_multiple_returns_expand_at_tail() {
    run_check_ints(
        "local function three() return 1, 2, 3 end
         local function sum(a, b, c, d) return a + b + c + (d or 0) end
         return sum(10, three())",
        &[16],
    );
}

#[test]
fn test_paren_truncates_to_one() {
    run_check_ints(
        "local function three() return 1, 2, 3 end
         local a, b = (three())
         return a, b == nil and 0 or b",
        &[1, 0],
    );
}

#[test]
fn test_missing_args_are_nil() {
    let r = run_lua(
        "local function f(a, b) return a, b end
         return f(1)",
    );
    assert_int(&r, 0, 1);
    assert_nil(&r, 1);
}

#[test]
fn test_extra_args_dropped() {
    run_check_ints(
        "local function f(a) return a end
         return f(1, 2, 3)",
        &[1],
    );
}

#[test]
fn test_varargs() {
    run_check_ints(
        "local function sum(...)
            local total = 0
            for _, v in ipairs({...}) do total = total + v end
            return total
         end
         return sum(1, 2, 3, 4)",
        &[10],
    );
}

#[test]
fn test_varargs_forwarding() {
    run_check_ints(
        "local function inner(a, b, c) return a + b + c end
         local function outer(...) return inner(...) end
         return outer(1, 2, 3)",
        &[6],
    );
}

#[test]
fn test_varargs_after_fixed_params() {
    run_check_ints(
        "local function f(first, ...)
            local rest = {...}
            return first, #rest
         end
         return f(10, 20, 30)",
        &[10, 2],
    );
}

#[test]
fn test_select() {
    run_check_ints(
        "local function f(...) return select('#', ...) end
         return f(1, nil, 3)",
        &[3],
    );
    run_check_ints(
        "local function f(...) return select(2, ...) end
         return f(10, 20, 30)",
        &[20, 30],
    );
}

#[test]
fn test_unpack() {
    run_check_ints("return unpack({10, 20, 30})", &[10, 20, 30]);
    // Explicit range, inclusive on both ends.
    run_check_ints("return unpack({1, 2, 3, 4}, 2, 3)", &[2, 3]);
    // The range may reach past the border; missing slots are nil.
    let r = run_lua("return unpack({7}, 1, 3)");
    assert_int(&r, 0, 7);
    assert_nil(&r, 1);
    assert_nil(&r, 2);
    // An empty range yields nothing.
    let r = run_lua("return unpack({1, 2}, 2, 1)");
    assert!(r.is_empty());
}

#[test]
fn test_unpack_expands_in_call() {
    run_check_ints(
        "local function sum(a, b, c) return a + b + c end
         return sum(unpack({1, 2, 3}))",
        &[6],
    );
}

#[test]
fn test_unpack_requires_table() {
    let e = run_lua_err("return unpack(5)");
    assert!(e.contains("bad argument"), "{e}");
}

#[test]
fn test_tail_call_deep_recursion() {
    // Tail calls must not grow the call stack: far deeper than the
    // 200-frame limit.
    run_check_ints(
        "local function loop(n, acc)
            if n == 0 then return acc end
            return loop(n - 1, acc + 1)
         end
         return loop(10000, 0)",
        &[10000],
    );
}

#[test]
fn test_non_tail_recursion_overflows() {
    let e = run_lua_err(
        "local function f(n) return 1 + f(n + 1) end
         return f(1)",
    );
    assert!(e.contains("stack overflow"), "{e}");
}

#[test]
fn test_method_call() {
    run_check_ints(
        "local obj = {value = 42}
         function obj:get() return self.value end
         return obj:get()",
        &[42],
    );
}

#[test]
fn test_method_with_args() {
    run_check_ints(
        "local acc = {total = 0}
         function acc:add(n)
            self.total = self.total + n
            return self.total
         end
         acc:add(5)
         return acc:add(10)",
        &[15],
    );
}

#[test]
fn test_dotted_function_declaration() {
    run_check_ints(
        "local m = {sub = {}}
         function m.sub.f(x) return x * 2 end
         return m.sub.f(21)",
        &[42],
    );
}

#[test]
fn test_anonymous_function() {
    run_check_ints("return (function(x) return x + 1 end)(41)", &[42]);
}

#[test]
fn test_function_as_value() {
    run_check_ints(
        "local function apply(f, x) return f(x) end
         return apply(function(n) return n * n end, 7)",
        &[49],
    );
}

#[test]
fn test_global_function() {
    run_check_ints(
        "function double(x) return x * 2 end
         return double(21)",
        &[42],
    );
}

#[test]
fn test_call_nil_errors() {
    let e = run_lua_err("local f return f()");
    assert!(e.contains("attempt to call a nil value"), "{e}");
}

#[test]
fn test_call_number_errors() {
    let e = run_lua_err("local x = 5 return x()");
    assert!(e.contains("attempt to call a number value"), "{e}");
}

#[test]
fn test_vararg_outside_vararg_fn_is_compile_error() {
    let e = compile_err("local f = function() return ... end");
    assert!(e.contains("..."), "{e}");
}

#[test]
fn test_register_limit_is_200() {
    // One below the ceiling still compiles...
    let mut ok_src = String::new();
    for i in 0..199 {
        ok_src.push_str(&format!("local v{i} = {i}\n"));
    }
    ok_src.push_str("return v0");
    run_check_ints(&ok_src, &[0]);

    // ...but more than 200 active locals must not.
    let mut src = String::new();
    for i in 0..205 {
        src.push_str(&format!("local v{i} = {i}\n"));
    }
    let e = compile_err(&src);
    assert!(e.contains("too many registers"), "{e}");
}
