//! Staged-versus-interpreted throughput over stream pipelines of varying
//! length: the compiled routine should hold a widening lead as the per-row
//! work grows.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use locus::ir::{AggOp, BinaryOp, ComparisonOp};
use locus::{Engine, EngineOptions, IrNode, VType};

/// Sum of squares below a cutoff over `[0, n)`.
fn pipeline(n: i32) -> IrNode {
    let range = IrNode::stream_range(IrNode::I32(0), IrNode::I32(n), IrNode::I32(1)).unwrap();
    let squared = IrNode::stream_map(
        range,
        "x",
        IrNode::binary(
            BinaryOp::Mul,
            IrNode::ref_("x", VType::Int32),
            IrNode::ref_("x", VType::Int32),
        )
        .unwrap(),
    )
    .unwrap();
    let capped = IrNode::stream_filter(
        squared,
        "y",
        IrNode::compare(
            ComparisonOp::Lt,
            IrNode::ref_("y", VType::Int32),
            IrNode::I32(1_000_000),
        )
        .unwrap(),
    )
    .unwrap();
    IrNode::stream_agg(capped, "y", AggOp::Sum, IrNode::ref_("y", VType::Int32)).unwrap()
}

fn bench_stream_pipeline(c: &mut Criterion) {
    let staged = Engine::new();
    let interpreted = Engine::with_options(EngineOptions::new().interpret_only());

    let mut group = c.benchmark_group("sum_of_squares");
    for n in [1_000i32, 10_000, 100_000] {
        let ir = pipeline(n);
        group.bench_with_input(BenchmarkId::new("staged", n), &ir, |b, ir| {
            b.iter(|| staged.run(ir).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("interpreted", n), &ir, |b, ir| {
            b.iter(|| interpreted.run(ir).unwrap())
        });
    }
    group.finish();
}

fn bench_compile_overhead(c: &mut Criterion) {
    let ir = pipeline(10);
    c.bench_function("compile_pipeline", |b| {
        b.iter(|| locus::stage::compile_program(&ir, &[], 64).unwrap())
    });
}

criterion_group!(benches, bench_stream_pipeline, bench_compile_overhead);
criterion_main!(benches);
