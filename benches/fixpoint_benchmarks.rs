//! Incremental fixpoint benchmarks: transitive closure maintenance over a
//! chain graph, insertion-driven and deletion-driven.

use cascade::{Config, Datum, Engine};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

const CLOSURE: &str = "define link(int, int); define path(int, int);\n\
                       path(X, Y) :- link(X, Y);\n\
                       path(X, Z) :- link(X, Y), path(Y, Z);";

fn chain_engine(nodes: i32) -> Engine {
    let engine = Engine::start(Config::default()).expect("engine starts");
    engine.install_program(CLOSURE).expect("installs");
    for i in 0..nodes - 1 {
        engine
            .install_fact("link", vec![Datum::Int32(i), Datum::Int32(i + 1)])
            .expect("insert");
    }
    engine
}

fn bench_closure_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_build");
    for nodes in [16, 32, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            b.iter_batched(
                || {
                    let engine = Engine::start(Config::default()).expect("engine starts");
                    engine.install_program(CLOSURE).expect("installs");
                    engine
                },
                |engine| {
                    for i in 0..nodes - 1 {
                        engine
                            .install_fact("link", vec![Datum::Int32(i), Datum::Int32(i + 1)])
                            .expect("insert");
                    }
                    engine
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

fn bench_single_edge_delta(c: &mut Criterion) {
    // Steady-state cost of one insert-then-delete against a warm closure.
    let engine = chain_engine(64);
    c.bench_function("single_edge_delta", |b| {
        b.iter(|| {
            engine
                .install_fact("link", vec![Datum::Int32(200), Datum::Int32(0)])
                .expect("insert");
            engine
                .delete_fact("link", vec![Datum::Int32(200), Datum::Int32(0)])
                .expect("delete");
        });
    });
}

criterion_group!(benches, bench_closure_build, bench_single_edge_delta);
criterion_main!(benches);
