//! Performance benchmarks for the trace optimizer
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Parsing of the text format
//! - Straight-line optimization of recorded traces
//! - Loop peeling
//! - Integer bound arithmetic

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use traceopt::intbound::IntBound;
use traceopt::ir::parser::parse_trace;
use traceopt::ir::Trace;
use traceopt::optimizer::{Optimizer, OptimizerConfig};
use traceopt::selfcheck::record;
use traceopt::unroll::UnrollOptimizer;

/// A chain of field reads, writes and arithmetic `len` steps long
fn heap_chain(len: usize) -> String {
    let mut text = String::from("struct Node class=1 { value: int, next: ref }\n---\n[p0, i1]\n");
    let mut last = "i1".to_string();
    for i in 0..len {
        let base = 2 + i * 3;
        text.push_str(&format!("i{} = getfield_gc_i(p0, descr=Node.value)\n", base));
        text.push_str(&format!("i{} = int_add(i{}, {})\n", base + 1, base, last));
        text.push_str(&format!("setfield_gc(p0, i{}, descr=Node.value)\n", base + 1));
        text.push_str(&format!("i{} = int_lt(i{}, 1000000)\n", base + 2, base + 1));
        text.push_str(&format!("guard_true(i{}) [p0, i{}]\n", base + 2, base + 1));
        last = format!("i{}", base + 1);
    }
    text.push_str(&format!("jump(p0, {})\n", last));
    text
}

fn recorded(count: u64) -> Vec<Trace> {
    (0..count)
        .filter_map(|seed| record(seed).ok())
        .filter_map(|r| parse_trace(&r.source).ok())
        .collect()
}

/// Benchmark: parsing the text format
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for len in [10, 100] {
        let source = heap_chain(len);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &source, |b, source| {
            b.iter(|| parse_trace(black_box(source)).unwrap())
        });
    }
    group.finish();
}

/// Benchmark: straight-line optimization
fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");

    let traces = recorded(50);
    group.bench_function("recorded", |b| {
        b.iter(|| {
            for trace in &traces {
                let _ = Optimizer::new().optimize(black_box(trace));
            }
        })
    });

    for len in [10, 100] {
        let trace = parse_trace(&heap_chain(len)).unwrap();
        group.throughput(Throughput::Elements(trace.len() as u64));
        group.bench_with_input(BenchmarkId::new("heap_chain", len), &trace, |b, trace| {
            b.iter(|| Optimizer::new().optimize(black_box(trace)).unwrap())
        });
    }
    group.finish();
}

/// Benchmark: loop peeling
fn bench_unroll(c: &mut Criterion) {
    let mut group = c.benchmark_group("unroll");
    for len in [10, 50] {
        let trace = parse_trace(&heap_chain(len)).unwrap();
        group.bench_with_input(BenchmarkId::new("heap_chain", len), &trace, |b, trace| {
            b.iter(|| {
                UnrollOptimizer::new(OptimizerConfig::default())
                    .optimize(black_box(trace))
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Benchmark: bound arithmetic
fn bench_intbound(c: &mut Criterion) {
    let a = IntBound::new(-1000, 1000).unwrap();
    let b = IntBound::new(3, 17).unwrap();
    c.bench_function("intbound_arith", |bench| {
        bench.iter(|| {
            let sum = black_box(&a).add_bound(black_box(&b));
            let product = sum.mul_bound(&b);
            let masked = product.and_bound(&IntBound::from_constant(255));
            black_box(masked.py_div_bound(&b))
        })
    });
}

criterion_group!(benches, bench_parse, bench_optimize, bench_unroll, bench_intbound);

criterion_main!(benches);
