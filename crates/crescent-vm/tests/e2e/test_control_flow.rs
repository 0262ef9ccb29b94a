use super::helpers::*;

#[test]
fn test_if_else() {
    run_check_ints("if true then return 1 else return 2 end", &[1]);
    run_check_ints("if false then return 1 else return 2 end", &[2]);
    run_check_ints(
        "local x = 5
         if x < 3 then return 1 elseif x < 10 then return 2 else return 3 end",
        &[2],
    );
}

#[test]
fn test_if_without_else() {
    run_check_ints("local x = 1 if x > 0 then x = 2 end return x", &[2]);
    run_check_ints("local x = 1 if x < 0 then x = 2 end return x", &[1]);
}

#[test]
fn test_while_loop() {
    run_check_ints(
        "local n, sum = 1, 0
         while n <= 10 do sum = sum + n n = n + 1 end
         return sum",
        &[55],
    );
}

#[test]
fn test_while_false_never_runs() {
    run_check_ints("local n = 0 while false do n = 1 end return n", &[0]);
}

#[test]
fn test_repeat_until() {
    run_check_ints(
        "local n = 0
         repeat n = n + 1 until n >= 5
         return n",
        &[5],
    );
    // Body runs at least once.
    run_check_ints("local n = 0 repeat n = n + 1 until true return n", &[1]);
}

#[test]
fn test_repeat_condition_sees_body_locals() {
    run_check_ints(
        "local n = 0
         repeat
            local done = n >= 3
            n = n + 1
         until done
         return n",
        &[4],
    );
}

#[test]
fn test_numeric_for() {
    run_check_ints(
        "local sum = 0 for i = 1, 5 do sum = sum + i end return sum",
        &[15],
    );
    run_check_ints(
        "local sum = 0 for i = 10, 1, -2 do sum = sum + i end return sum",
        &[30],
    );
    run_check_ints(
        "local n = 0 for i = 5, 1 do n = n + 1 end return n",
        &[0],
    );
}

#[test]
fn test_numeric_for_float() {
    let r = run_lua(
        "local sum = 0.0
         for i = 1.0, 2.0, 0.5 do sum = sum + i end
         return sum",
    );
    assert_float(&r, 0, 4.5);
}

#[test]
fn test_numeric_for_keeps_integer_subtype() {
    let (r, vm) = run_lua_vm("for i = 1, 1 do return math.floor(i) == i, 1 // i end");
    assert_bool(&r, 0, true);
    assert_int(&r, 1, 1);
    drop(vm);
}

#[test]
fn test_for_step_zero_errors() {
    let e = run_lua_err("for i = 1, 10, 0 do end");
    assert!(e.contains("'for' step is zero"), "{e}");
}

#[test]
fn test_for_non_number_errors() {
    let e = run_lua_err("for i = {}, 10 do end");
    assert!(e.contains("'for' initial value must be a number"), "{e}");
}

#[test]
fn test_break() {
    run_check_ints(
        "local n = 0
         while true do
            n = n + 1
            if n == 7 then break end
         end
         return n",
        &[7],
    );
    run_check_ints(
        "local sum = 0
         for i = 1, 100 do
            if i > 3 then break end
            sum = sum + i
         end
         return sum",
        &[6],
    );
}

#[test]
fn test_break_innermost_loop_only() {
    run_check_ints(
        "local count = 0
         for i = 1, 3 do
            for j = 1, 10 do
               if j == 2 then break end
               count = count + 1
            end
         end
         return count",
        &[3],
    );
}

#[test]
fn test_goto_forward() {
    run_check_ints(
        "local x = 1
         do goto skip end
         x = 2
         ::skip::
         return x",
        &[1],
    );
}

#[test]
fn test_goto_backward_loop() {
    run_check_ints(
        "local n = 0
         ::top::
         n = n + 1
         if n < 5 then goto top end
         return n",
        &[5],
    );
}

#[test]
fn test_goto_continue_idiom() {
    run_check_ints(
        "local sum = 0
         for i = 1, 10 do
            if i % 2 == 0 then goto continue end
            sum = sum + i
            ::continue::
         end
         return sum",
        &[25],
    );
}

#[test]
fn test_goto_continue_skips_local_declaration() {
    // A label at the end of the block is outside the scope of the
    // block's locals, so the goto may jump over the declaration.
    run_check_ints(
        "local count = 0
         for i = 1, 5 do
            if i > 3 then goto continue end
            local doubled = i * 2
            count = count + doubled
            ::continue::
         end
         return count",
        &[12],
    );
}

#[test]
fn test_nested_loops() {
    run_check_ints(
        "local total = 0
         for i = 1, 3 do
            for j = 1, 3 do
               total = total + i * j
            end
         end
         return total",
        &[36],
    );
}

#[test]
fn test_generic_for_pairs() {
    run_check_ints(
        "local t = {a = 1, b = 2, c = 3}
         local sum = 0
         for k, v in pairs(t) do sum = sum + v end
         return sum",
        &[6],
    );
}

#[test]
fn test_generic_for_ipairs() {
    run_check_ints(
        "local t = {10, 20, 30, nil, 50}
         local sum = 0
         for i, v in ipairs(t) do sum = sum + v end
         return sum",
        &[60],
    );
}

#[test]
fn test_generic_for_custom_iterator() {
    run_check_ints(
        "local function range(n)
            local i = 0
            return function()
               i = i + 1
               if i <= n then return i end
            end
         end
         local sum = 0
         for v in range(4) do sum = sum + v end
         return sum",
        &[10],
    );
}

#[test]
fn test_do_block_scoping() {
    run_check_ints(
        "local x = 1
         do local x = 2 end
         return x",
        &[1],
    );
}

#[test]
fn test_compile_errors() {
    let e = compile_err("break");
    assert!(e.contains("break"), "{e}");
    let e = compile_err("goto nowhere");
    assert!(e.contains("label"), "{e}");
    let e = compile_err("::a:: ::a::");
    assert!(e.contains("label"), "{e}");
    let e = compile_err("if true then");
    assert!(e.contains("expected"), "{e}");
}
