use super::helpers::*;

#[test]
fn test_basic_arithmetic() {
    run_check_ints("return 1 + 2", &[3]);
    run_check_ints("return 10 - 3", &[7]);
    run_check_ints("return 6 * 7", &[42]);
    run_check_ints("return 2 + 3 * 4", &[14]);
    run_check_ints("return (2 + 3) * 4", &[20]);
}

#[test]
fn test_division_is_float() {
    let r = run_lua("return 4 / 2");
    assert_float(&r, 0, 2.0);
    let r = run_lua("return 1 / 2");
    assert_float(&r, 0, 0.5);
}

#[test]
fn test_floor_division() {
    run_check_ints("return 7 // 2", &[3]);
    run_check_ints("return -7 // 2", &[-4]);
    let r = run_lua("return 7.0 // 2");
    assert_float(&r, 0, 3.0);
}

#[test]
fn test_modulo() {
    run_check_ints("return 5 % 3", &[2]);
    run_check_ints("return -5 % 3", &[1]);
    run_check_ints("return 5 % -3", &[-1]);
    let r = run_lua("return 5.5 % 2");
    assert_float(&r, 0, 1.5);
}

#[test]
fn test_pow_is_float() {
    let r = run_lua("return 2 ^ 10");
    assert_float(&r, 0, 1024.0);
    let r = run_lua("return 2 ^ -1");
    assert_float(&r, 0, 0.5);
}

#[test]
fn test_pow_right_associative() {
    let r = run_lua("return 2 ^ 3 ^ 2");
    assert_float(&r, 0, 512.0);
}

#[test]
fn test_unary_minus() {
    run_check_ints("local x = 5 return -x", &[-5]);
    let r = run_lua("return -(2.5)");
    assert_float(&r, 0, -2.5);
}

#[test]
fn test_bitwise_ops() {
    run_check_ints("return 6 & 3", &[2]);
    run_check_ints("return 6 | 3", &[7]);
    run_check_ints("return 6 ~ 3", &[5]);
    run_check_ints("return ~0", &[-1]);
    run_check_ints("return 1 << 4", &[16]);
    run_check_ints("return 256 >> 4", &[16]);
}

#[test]
fn test_shift_edges() {
    run_check_ints("return 1 << 64", &[0]);
    run_check_ints("return 1 << 63", &[i64::MIN]);
    // Right shift is logical.
    run_check_ints("return -1 >> 63", &[1]);
    // Negative shift reverses direction.
    run_check_ints("return 16 >> -2", &[64]);
}

#[test]
fn test_string_number_coercion() {
    run_check_ints("return '3' + 4", &[7]);
    run_check_ints("return '0x10' + 0", &[16]);
    let r = run_lua("return '3.5' + 1");
    assert_float(&r, 0, 4.5);
}

#[test]
fn test_concat_coercion() {
    let (r, vm) = run_lua_vm("return 1 .. 2");
    assert_str(&r, 0, "12", &vm);
    let (r, vm) = run_lua_vm("return 'x = ' .. 1.5");
    assert_str(&r, 0, "x = 1.5", &vm);
}

#[test]
fn test_concat_chain_right_assoc() {
    let (r, vm) = run_lua_vm("return 'a' .. 'b' .. 'c' .. 'd'");
    assert_str(&r, 0, "abcd", &vm);
}

#[test]
fn test_comparisons() {
    let r = run_lua("return 1 < 2, 2 < 1, 1 <= 1, 2 > 1, 2 >= 3, 1 == 1, 1 ~= 1");
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, false);
    assert_bool(&r, 2, true);
    assert_bool(&r, 3, true);
    assert_bool(&r, 4, false);
    assert_bool(&r, 5, true);
    assert_bool(&r, 6, false);
}

#[test]
fn test_string_comparison() {
    let r = run_lua("return 'abc' < 'abd', 'abc' < 'ab', 'a' <= 'a'");
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, false);
    assert_bool(&r, 2, true);
}

#[test]
fn test_logic_operators() {
    let r = run_lua("return 1 and 2, nil and 2, false or 'x', nil or false");
    assert_int(&r, 0, 2);
    assert_nil(&r, 1);
    assert!(r[2].is_string());
    assert_bool(&r, 3, false);
}

#[test]
fn test_logic_short_circuit() {
    // The right operand must not be evaluated.
    run_check_ints(
        "local n = 0
         local function bump() n = n + 1 return true end
         local _ = false and bump()
         local _ = true or bump()
         return n",
        &[0],
    );
}

#[test]
fn test_not() {
    let r = run_lua("return not nil, not false, not 0, not ''");
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, true);
    assert_bool(&r, 2, false);
    assert_bool(&r, 3, false);
}

#[test]
fn test_arith_error_messages() {
    let e = run_lua_err("return {} + 1");
    assert!(e.contains("attempt to perform arithmetic"), "{e}");
    let e = run_lua_err("return 1 // 0");
    assert!(e.contains("n//0"), "{e}");
    let e = run_lua_err("return 1.5 | 2");
    assert!(e.contains("no integer representation"), "{e}");
    let e = run_lua_err("return nil .. 'x'");
    assert!(e.contains("attempt to concatenate a nil value"), "{e}");
}

#[test]
fn test_compare_error() {
    let e = run_lua_err("return 1 < 'x'");
    assert!(e.contains("attempt to compare"), "{e}");
}
