//! Backend Evaluation Benchmarks
//!
//! Compares the three evaluation backends on behavioral expressions of increasing size:
//!
//! - **Interpreted**: walks the node tree on every call
//! - **Program**: runs a flattened stack program
//! - **Jit**: calls native code generated by Cranelift
//!
//! Sources are bound once during setup; only evaluation is measured in the first group.
//! The second group measures the one-time cost of building a complete behavior (parsing,
//! differentiation and building every derivative evaluator) per backend.
//!
//! Run with: `cargo bench --bench evaluation`

use std::hint::black_box;

use behave_jit::prelude::*;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const EXPRESSIONS: [(&str, &str); 5] = [
    ("linear", "2.2 * v(a) + 1.1"),
    ("diode", "1f * (exp(v(a) / 25.85m) - 1)"),
    ("rational", "(v(a)^3 + 2*v(a)^2 - 5*v(a) + 1) / (v(b)^2 + 3*v(b) + 2)"),
    ("switch", "if(v(ctrl) > 0.5, v(a) / 1k, v(a) / 1meg)"),
    (
        "mixed",
        "tanh(v(a, b) * 10) * max(i(vsense), 0) + limit(v(ctrl), 0, 5) * sqrt(abs(v(a)))",
    ),
];

const BACKENDS: [Backend; 3] = [Backend::Interpreted, Backend::Program, Backend::Jit];

fn bindings() -> Bindings<f64> {
    let mut bindings = Bindings::default();
    bindings
        .bind_value(&Variable::voltage("a"), 0.42)
        .bind_value(&Variable::voltage("b"), -1.3)
        .bind_value(&Variable::voltage("ctrl"), 0.7)
        .bind_value(&Variable::current("vsense"), 2.5e-3);
    bindings
}

fn benchmark_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluation");
    let environment = Environment::new(bindings());

    for (name, text) in EXPRESSIONS {
        let node = parse(text).expect("benchmark expression parses");
        for backend in BACKENDS {
            let callable =
                build_callable(&node, &environment, backend).expect("benchmark expression builds");
            group.bench_with_input(
                BenchmarkId::new(backend.to_string(), name),
                &callable,
                |b, callable| b.iter(|| black_box(callable.call())),
            );
        }
    }
    group.finish();
}

fn benchmark_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(20);

    for (name, text) in EXPRESSIONS {
        for backend in BACKENDS {
            group.bench_with_input(
                BenchmarkId::new(backend.to_string(), name),
                &text,
                |b, text| {
                    b.iter(|| {
                        Behavior::parse(
                            black_box(text),
                            Environment::new(bindings()),
                            BuildOptions::default().with_backend(backend),
                        )
                        .expect("benchmark expression builds")
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_evaluation, benchmark_build);
criterion_main!(benches);
