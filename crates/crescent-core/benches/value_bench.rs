use criterion::{black_box, criterion_group, criterion_main, Criterion};
use crescent_core::table::Table;
use crescent_core::value::LuaValue;

fn bench_raw_equals_numeric(c: &mut Criterion) {
    let i = LuaValue::Integer(42);
    let f = LuaValue::Float(42.0);
    c.bench_function("value_eq_int_int", |b| {
        b.iter(|| black_box(i).raw_equals(&black_box(i)));
    });
    c.bench_function("value_eq_int_float", |b| {
        b.iter(|| black_box(i).raw_equals(&black_box(f)));
    });
}

fn bench_truthiness(c: &mut Criterion) {
    let nil = LuaValue::Nil;
    let one = LuaValue::Integer(1);
    c.bench_function("value_is_falsy_nil", |b| {
        b.iter(|| black_box(nil).is_falsy());
    });
    c.bench_function("value_is_falsy_int", |b| {
        b.iter(|| black_box(one).is_falsy());
    });
}

fn bench_table_array_access(c: &mut Criterion) {
    let mut t = Table::new(1024, 0);
    for i in 1..=1024 {
        t.raw_seti(i, LuaValue::Integer(i));
    }
    c.bench_function("table_raw_geti_array", |b| {
        b.iter(|| t.raw_geti(black_box(512)));
    });
    c.bench_function("table_length", |b| {
        b.iter(|| t.length());
    });
}

criterion_group!(
    benches,
    bench_raw_equals_numeric,
    bench_truthiness,
    bench_table_array_access
);
criterion_main!(benches);
