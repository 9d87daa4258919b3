//! Benchmarks for the sparse compute pipeline

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use powerinfer_runtime::memory::{ListArena, Lru};
use powerinfer_runtime::quant::{quantize_matrix, quantize_row_q8_0, vec_dot_q4_0_q8_0};
use powerinfer_runtime::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const D_MODEL: usize = 1024;
const D_FF: usize = 4096;

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn pinned_context(rng: &mut StdRng) -> RuntimeContext {
    let ctx = RuntimeContext::new(
        RuntimeConfig::default().disk_buffer_capacity(1 << 16),
        Arc::new(MemoryStore::new(Vec::new())),
    )
    .unwrap();
    for (i, name) in ["up", "down"].iter().enumerate() {
        let w = random_vector(D_FF * D_MODEL, rng);
        let bytes = quantize_matrix(QuantType::Q4_0, &w, D_MODEL).unwrap();
        let desc = ChunkDescriptor::new(*name, ChunkId::new(0, i as u32), QuantType::Q4_0, D_MODEL, D_FF, 0).unwrap();
        ctx.register_chunk(desc, Some(bytes.as_slice())).unwrap();
    }
    ctx
}

fn benchmark_vec_dot(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let w = quantize_matrix(QuantType::Q4_0, &random_vector(D_MODEL, &mut rng), D_MODEL).unwrap();
    let mut x = vec![0u8; QuantType::Q8_0.row_size(D_MODEL).unwrap()];
    quantize_row_q8_0(&random_vector(D_MODEL, &mut rng), &mut x);

    c.bench_function("vec_dot_q4_0_q8_0_1024", |b| {
        b.iter(|| black_box(vec_dot_q4_0_q8_0(D_MODEL, &w, &x)))
    });
}

fn benchmark_sparsity_levels(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let ctx = pinned_context(&mut rng);
    let layer = ctx.layer(&["up"]).unwrap();
    let input = random_vector(D_MODEL, &mut rng);
    let mut output = vec![0.0; D_FF];
    let mut ws = Workspace::new(1 << 20).unwrap();

    let mut group = c.benchmark_group("sparse_matmul");
    for sparsity in [0.0, 0.5, 0.9, 0.99] {
        let keep = ((1.0 - sparsity) * D_FF as f64).max(1.0) as usize;
        let step = D_FF / keep;
        let hot: Vec<usize> = (0..D_FF).step_by(step.max(1)).take(keep).collect();
        let decisions = vec![RouterDecision::from_hot_units(D_FF, &hot).unwrap()];

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:.0}%", sparsity * 100.0)),
            &decisions,
            |b, decisions| {
                b.iter(|| {
                    ctx.sparse_matmul(&layer, &input, decisions, &mut output, &mut ws)
                        .unwrap();
                    black_box(&output);
                })
            },
        );
    }
    group.finish();
}

fn benchmark_fused_ffn(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let ctx = pinned_context(&mut rng);
    let weights = FfnWeights {
        up: ctx.layer(&["up"]).unwrap(),
        gate: None,
        down: ctx.layer(&["down"]).unwrap(),
        up_bias: None,
        activation: FfnActivation::Relu,
    };
    let input = random_vector(D_MODEL, &mut rng);
    let predictor = LowRankPredictor::random(D_MODEL, D_FF, 64, 4);
    let router = Router::with_policies(
        SparsityConfig {
            threshold: 0.05,
            min_active: 64,
        },
        ExpertRoutingConfig::default(),
    );
    let decisions = vec![router.route(&predictor, &input).unwrap()];
    let mut output = vec![0.0; D_MODEL];
    let mut ws = Workspace::new(1 << 22).unwrap();

    c.bench_function("fused_sparse_ffn", |b| {
        b.iter(|| {
            ctx.fused_sparse_ffn(&weights, &input, &decisions, None, &mut output, &mut ws)
                .unwrap();
            black_box(&output);
        })
    });
}

fn benchmark_lru(c: &mut Criterion) {
    let mut arena = ListArena::with_capacity(1025);
    let mut lru = Lru::new(&mut arena);
    let nodes: Vec<_> = (0..1024u32).map(|i| arena.insert(i)).collect();
    for &n in &nodes {
        lru.add(&mut arena, n, true);
    }

    let mut i = 0;
    c.bench_function("lru_promote", |b| {
        b.iter(|| {
            i = (i * 31 + 7) % nodes.len();
            lru.promote(&mut arena, nodes[i]);
        })
    });
}

criterion_group!(
    benches,
    benchmark_vec_dot,
    benchmark_sparsity_levels,
    benchmark_fused_ffn,
    benchmark_lru,
);
criterion_main!(benches);
