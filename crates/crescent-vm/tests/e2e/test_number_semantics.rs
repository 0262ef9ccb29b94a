use super::helpers::*;

#[test]
fn test_integer_arithmetic_stays_integer() {
    let (r, vm) = run_lua_vm("return type(1 + 1), 1 + 1");
    assert_str(&r, 0, "number", &vm);
    assert!(r[1].as_integer().is_some(), "1+1 must be integer-tagged");
    assert_int(&r, 1, 2);
}

#[test]
fn test_mixed_arithmetic_is_float() {
    let (r, vm) = run_lua_vm("return type(1 + 1.0), 1 + 1.0");
    assert_str(&r, 0, "number", &vm);
    assert!(r[1].as_float().is_some(), "1+1.0 must be float-tagged");
    assert_float(&r, 1, 2.0);
}

#[test]
fn test_cross_subtype_equality() {
    let r = run_lua("return 1 == 1.0, 0 == 0.0, 1 == 1.5");
    assert_bool(&r, 0, true);
    assert_bool(&r, 1, true);
    assert_bool(&r, 2, false);
}

#[test]
fn test_floor_div_preserves_subtype() {
    let r = run_lua("return 1 // 1");
    assert_int(&r, 0, 1);
    let r = run_lua("return 1.0 // 1");
    assert_float(&r, 0, 1.0);
}

#[test]
fn test_integer_overflow_wraps() {
    run_check_ints(
        "return math.maxinteger + 1 == math.mininteger and 1 or 0",
        &[1],
    );
    run_check_ints(
        "return math.mininteger - 1 == math.maxinteger and 1 or 0",
        &[1],
    );
}

#[test]
fn test_maxinteger_constants() {
    run_check_ints("return math.maxinteger", &[i64::MAX]);
    run_check_ints("return math.mininteger", &[i64::MIN]);
}

#[test]
fn test_huge() {
    let r = run_lua("return math.huge, -math.huge");
    assert_eq!(r[0].as_float(), Some(f64::INFINITY));
    assert_eq!(r[1].as_float(), Some(f64::NEG_INFINITY));
}

#[test]
fn test_math_floor_ceil_abs() {
    run_check_ints("return math.floor(1.5), math.ceil(1.5), math.abs(-3)", &[1, 2, 3]);
    // floor of an integer stays an integer.
    run_check_ints("return math.floor(7)", &[7]);
}

#[test]
fn test_nan_inequality() {
    let r = run_lua("local nan = 0/0 return nan == nan, nan ~= nan");
    assert_bool(&r, 0, false);
    assert_bool(&r, 1, true);
}

#[test]
fn test_tostring_formats() {
    let (r, vm) = run_lua_vm("return tostring(1), tostring(1.0), tostring(1.5), tostring(-0.0)");
    assert_str(&r, 0, "1", &vm);
    assert_str(&r, 1, "1.0", &vm);
    assert_str(&r, 2, "1.5", &vm);
    assert_str(&r, 3, "-0.0", &vm);
}

#[test]
fn test_tostring_specials() {
    let (r, vm) = run_lua_vm("return tostring(1/0), tostring(-1/0), tostring(true), tostring(nil)");
    assert_str(&r, 0, "inf", &vm);
    assert_str(&r, 1, "-inf", &vm);
    assert_str(&r, 2, "true", &vm);
    assert_str(&r, 3, "nil", &vm);
}

#[test]
fn test_tonumber() {
    let r = run_lua(
        "return tonumber('42'), tonumber('0x10'), tonumber('1.5'), tonumber('nope'), tonumber({})",
    );
    assert_int(&r, 0, 42);
    assert_int(&r, 1, 16);
    assert_float(&r, 2, 1.5);
    assert_nil(&r, 3);
    assert_nil(&r, 4);
}

#[test]
fn test_hex_literals() {
    run_check_ints("return 0xff, 0xFF", &[255, 255]);
    let r = run_lua("return 0x1p4");
    assert_float(&r, 0, 16.0);
}

#[test]
fn test_integer_literal_tagging() {
    let r = run_lua("return 3, 3.0, 3e0, 30");
    assert!(r[0].as_integer().is_some());
    assert!(r[1].as_float().is_some());
    assert!(r[2].as_float().is_some());
    assert!(r[3].as_integer().is_some());
}

#[test]
fn test_float_to_int_table_key_normalization() {
    run_check_ints("local t = {} t[2] = 7 return t[2.0]", &[7]);
}

#[test]
fn test_type_names() {
    let (r, vm) = run_lua_vm(
        "return type(nil), type(true), type(1), type('s'), type({}), type(print)",
    );
    assert_str(&r, 0, "nil", &vm);
    assert_str(&r, 1, "boolean", &vm);
    assert_str(&r, 2, "number", &vm);
    assert_str(&r, 3, "string", &vm);
    assert_str(&r, 4, "table", &vm);
    assert_str(&r, 5, "function", &vm);
}
