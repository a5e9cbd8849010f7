//! Criterion benchmarks for compiled-expression evaluation.
//!
//! Each case compiles once outside the timed loop and measures `evaluate`
//! only: scope setup, watchdog bookkeeping and the tree walk itself.
//!
//! Run:
//!   cargo bench
//!   cargo bench -- path          # one group
//!   cargo bench -- tail_calls    # one group

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use jsonata_core::{JValue, Jsonata, RuntimeBounds};

// ── Data builders ─────────────────────────────────────────────────────────────

/// Tiny nested object used by the simple path benchmarks.
fn nested_user() -> JValue {
    let mut address = IndexMap::new();
    address.insert("city".to_string(), JValue::from("Lisbon"));
    let mut user = IndexMap::new();
    user.insert("name".to_string(), JValue::from("Ana"));
    user.insert("address".to_string(), JValue::object(address));
    let mut root = IndexMap::new();
    root.insert("user".to_string(), JValue::object(user));
    JValue::object(root)
}

/// `n` product objects: {id, name, category, price, inStock, tags}.
fn products(n: usize) -> JValue {
    let categories = ["Electronics", "Clothing", "Books", "Home"];
    let items: Vec<JValue> = (0..n)
        .map(|i| {
            let tags: Vec<JValue> = (0..i % 4).map(|j| JValue::string(format!("tag{j}"))).collect();
            let mut p = IndexMap::new();
            p.insert("id".to_string(), JValue::from(i));
            p.insert("name".to_string(), JValue::string(format!("Product {i}")));
            p.insert("category".to_string(), JValue::string(categories[i % 4]));
            p.insert("price".to_string(), JValue::from(10.0 + i as f64 * 2.5));
            p.insert("inStock".to_string(), JValue::Bool(i % 3 != 0));
            p.insert("tags".to_string(), JValue::array(tags));
            JValue::object(p)
        })
        .collect();
    let mut root = IndexMap::new();
    root.insert("products".to_string(), JValue::array(items));
    JValue::object(root)
}

// ── Helper: compile once ──────────────────────────────────────────────────────

fn compile(expression: &str) -> Jsonata {
    let mut expr = Jsonata::new(expression).unwrap();
    expr.set_runtime_bounds(RuntimeBounds { timeout: None, max_depth: 10_000 });
    expr
}

// ── Bench groups ──────────────────────────────────────────────────────────────

fn bench_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("path");
    let user = nested_user();
    let catalog = products(100);

    for (name, expression, data) in [
        ("field", "user.name", &user),
        ("nested_field", "user.address.city", &user),
        ("map_over_array", "products.name", &catalog),
        ("wildcard", "products[0].*", &catalog),
        ("descendants", "**.tags", &catalog),
    ] {
        let expr = compile(expression);
        group.bench_function(name, |b| b.iter(|| black_box(expr.evaluate(black_box(data)).unwrap())));
    }
    group.finish();
}

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    for size in [100usize, 1000] {
        let data = products(size);
        let by_value = compile("products[price > 100 and inStock].name");
        group.bench_with_input(BenchmarkId::new("predicate", size), &data, |b, data| {
            b.iter(|| black_box(by_value.evaluate(black_box(data)).unwrap()))
        });
        let by_index = compile("products[-1].id");
        group.bench_with_input(BenchmarkId::new("index", size), &data, |b, data| {
            b.iter(|| black_box(by_index.evaluate(black_box(data)).unwrap()))
        });
    }
    group.finish();
}

fn bench_grouping(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_by");
    let data = products(1000);
    for (name, expression) in [
        ("sum_per_category", "products{category: $sum(price)}"),
        ("count_per_category", "products{category: $count(id)}"),
        ("order_by_price", "products^(>price).id"),
    ] {
        let expr = compile(expression);
        group.bench_function(name, |b| b.iter(|| black_box(expr.evaluate(black_box(&data)).unwrap())));
    }
    group.finish();
}

fn bench_tail_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("tail_calls");
    let expr = compile(
        "($loop := function($n, $acc) { $n = 0 ? $acc : $loop($n - 1, $acc + $n) }; $loop($count, 0))",
    );
    for count in [100usize, 10_000] {
        let mut bindings = jsonata_core::Bindings::new();
        bindings.insert("count".to_string(), JValue::from(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &bindings, |b, bindings| {
            b.iter(|| black_box(expr.evaluate_with_bindings(&JValue::Undefined, bindings).unwrap()))
        });
    }
    group.finish();
}

fn bench_ranges(c: &mut Criterion) {
    let mut group = c.benchmark_group("range");
    for (name, expression) in [
        ("count_lazy", "$count([1..1000000])"),
        ("sum_materialized", "$sum([1..100000])"),
        ("map_small", "[1..1000].($ * 2)"),
    ] {
        let expr = compile(expression);
        group.bench_function(name, |b| b.iter(|| black_box(expr.evaluate(&JValue::Undefined).unwrap())));
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_paths,
    bench_filters,
    bench_grouping,
    bench_tail_calls,
    bench_ranges,
);
criterion_main!(benches);
