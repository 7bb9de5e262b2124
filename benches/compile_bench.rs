//! Benchmarks for cellflow compilation and execution

use cellflow::compiler::compile;
use cellflow::compute::{CompileOptions, Instance};
use cellflow::express::Express;
use cellflow::flow::{DataType, Flow, Shape};
use cellflow::kernels::standard_library;
use cellflow::runtime::HostRuntime;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

/// Benchmark compile time for chains of element-wise operations
fn bench_compile_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_time");
    let library = standard_library();

    for &size in &[1, 8, 16, 32, 64] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(format!("{}_ops", size), |b| {
            b.iter(|| {
                let flow = create_chain_flow(size, 64);
                let net = compile(
                    black_box(flow),
                    &library,
                    Arc::new(HostRuntime::new()),
                    CompileOptions::default(),
                );
                black_box(net)
            })
        });
    }

    group.finish();
}

/// Benchmark instance execution of a fused expression chain
fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute");
    let library = standard_library();

    for &elements in &[64, 1024, 16384] {
        let flow = create_chain_flow(8, elements);
        let net = compile(
            flow,
            &library,
            Arc::new(HostRuntime::new()),
            CompileOptions::default(),
        )
        .unwrap();
        let cell = net.find_cell("chain").unwrap();
        let x = net.get_parameter("x").unwrap();
        let mut instance = Instance::new(&net, cell).unwrap();
        instance.set_f32(x, &vec![1.0; elements]);

        group.throughput(Throughput::Elements(elements as u64));
        group.bench_function(format!("{}_elements", elements), |b| {
            b.iter(|| {
                let result = instance.compute();
                black_box(result)
            })
        });
    }

    group.finish();
}

/// Benchmark recipe parsing and optimization
fn bench_expression(c: &mut Criterion) {
    let recipe = "$0=Add(%0,%1);$1=Mul($0,%2);$2=Add($1,#0);@0=Tanh($2);@1=Sigmoid($2)";

    c.bench_function("parse_recipe", |b| {
        b.iter(|| {
            let expr = Express::from_recipe(black_box(recipe));
            black_box(expr)
        })
    });

    c.bench_function("optimize_recipe", |b| {
        b.iter(|| {
            let mut expr = Express::from_recipe(black_box(recipe)).unwrap();
            expr.eliminate_common_subexpressions();
            expr.fuse_mul_add();
            expr.cache_results();
            expr.compute_live_ranges();
            let regs = expr.allocate_registers();
            black_box(regs)
        })
    });
}

/// Create a flow with a chain of N alternating add/mul operations
fn create_chain_flow(size: usize, elements: usize) -> Flow {
    let mut flow = Flow::new();
    let f = flow.add_func("chain");
    let shape = Shape::of(&[elements as i64]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let c = flow.add_const_f32("c", Shape::scalar(), &[1.5]);
    let mut last = x;
    for i in 0..size {
        let next = flow.add_var(&format!("v{}", i), DataType::Float32, shape.clone());
        let kind = if i % 2 == 0 { "Add" } else { "Mul" };
        flow.add_op(f, &format!("op{}", i), kind, &[last, c], &[next]);
        last = next;
    }
    flow
}

criterion_group!(benches, bench_compile_time, bench_compute, bench_expression);
criterion_main!(benches);
