//! Criterion benchmarks for the neural-mass engine.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel,simd
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use neurocore::connectome::{edge_count, CouplingMatrix, ExecutionTier};
use neurocore::dynamics::{EngineParams, NeuroCore, SystemState};
use neurocore::integrator::IntegratorBudget;
use neurocore::prng::Prng;

fn make_engine(regions: usize, tier: ExecutionTier, seed: u64) -> NeuroCore {
    let mut rng = Prng::new(seed);
    let vec = rng.uniform_vec(edge_count(regions), 0.0, 1.0);
    let matrix = CouplingMatrix::from_upper_triangle(&vec, regions).expect("valid coupling");
    NeuroCore::new(&matrix, EngineParams::pipeline().with_tier(tier)).expect("valid params")
}

/// Benchmark one derivative evaluation across the standard parcellation sizes.
fn bench_derivative_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("derivative_size");

    for regions in [86usize, 129, 234, 463].iter() {
        group.throughput(Throughput::Elements(*regions as u64));

        group.bench_with_input(BenchmarkId::new("scalar", regions), regions, |b, &n| {
            let engine = make_engine(n, ExecutionTier::Scalar, 42);
            let state = SystemState::resting(n, &mut Prng::new(1));
            let mut y = state.r.clone();
            y.extend_from_slice(&state.v);
            let mut dydt = vec![0.0; 2 * n];

            b.iter(|| {
                engine.derivative(black_box(&y), &mut dydt);
                black_box(dydt[0])
            });
        });
    }

    group.finish();
}

/// Benchmark the coupling mat-vec on every execution tier at full resolution.
fn bench_matvec_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("matvec_tier");

    let n = 463;
    let mut rng = Prng::new(9);
    let matrix =
        CouplingMatrix::from_upper_triangle(&rng.uniform_vec(edge_count(n), 0.0, 1.0), n)
            .expect("valid coupling");
    let x = rng.uniform_vec(n, -1.0, 1.0);
    group.throughput(Throughput::Elements((n * n) as u64));

    for (name, tier) in [
        ("scalar", ExecutionTier::Scalar),
        ("simd", ExecutionTier::Simd),
        ("parallel", ExecutionTier::Parallel),
    ] {
        // Tiers whose feature is off fall back to scalar.
        let label = format!("{name}_{:?}", tier.effective()).to_lowercase();
        group.bench_function(label, |b| {
            let mut out = vec![0.0; n];
            b.iter(|| {
                matrix.mul_vec(black_box(&x), &mut out, tier);
                black_box(out[0])
            });
        });
    }

    group.finish();
}

/// Benchmark a short end-to-end integration.
fn bench_simulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate");
    group.sample_size(10);

    for regions in [86usize, 234].iter() {
        group.bench_with_input(BenchmarkId::new("t10_dt0.1", regions), regions, |b, &n| {
            let engine = make_engine(n, ExecutionTier::Scalar, 3);
            b.iter(|| {
                let traj = engine
                    .simulate_with_budget(
                        None,
                        None,
                        &mut Prng::new(5),
                        10.0,
                        0.1,
                        IntegratorBudget::default(),
                    )
                    .expect("simulation succeeds");
                black_box(traj.timesteps())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_derivative_sizes,
    bench_matvec_tiers,
    bench_simulate
);
criterion_main!(benches);
