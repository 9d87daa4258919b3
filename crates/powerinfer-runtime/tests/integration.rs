use std::io::Write;
use std::sync::Arc;

use half::f16;
use powerinfer_runtime::compute::ThresholdGate;
use powerinfer_runtime::quant::{dequantize_row, quantize_matrix, Q4_0_BLOCK_BYTES, QK};
use powerinfer_runtime::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Q4_0 rows with random nibbles and a fixed per-block scale
fn random_q4_0(rows: usize, cols: usize, scale: f32, rng: &mut StdRng) -> Vec<u8> {
    let blocks = rows * cols / QK;
    let mut bytes = Vec::with_capacity(blocks * Q4_0_BLOCK_BYTES);
    for _ in 0..blocks {
        bytes.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        bytes.extend((0..QK / 2).map(|_| rng.gen::<u8>()));
    }
    bytes
}

fn random_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn file_context(config: RuntimeConfig, prefix: usize, payload: &[u8]) -> RuntimeContext {
    init_tracing();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![0u8; prefix]).unwrap();
    file.write_all(payload).unwrap();
    file.flush().unwrap();
    RuntimeContext::new(config, Arc::new(file)).unwrap()
}

fn reference_dot(qtype: QuantType, row: &[u8], x: &[f32]) -> f32 {
    let mut w = vec![0.0; x.len()];
    dequantize_row(qtype, row, &mut w).unwrap();
    w.iter().zip(x).map(|(a, b)| (*a as f64) * (*b as f64)).sum::<f64>() as f32
}

// ---------------------------------------------------------------------------
// Round trip through disk paging
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_l0_up_from_disk() {
    const COLS: usize = 4096;
    const ROWS: usize = 11008;
    const OFFSET: u64 = 1024;

    let mut rng = StdRng::seed_from_u64(7);
    let weights = random_q4_0(ROWS, COLS, 0.01, &mut rng);
    let ctx = file_context(RuntimeConfig::default().threads(4), OFFSET as usize, &weights);

    let desc = ChunkDescriptor::new("L0.up", ChunkId::new(0, 0), QuantType::Q4_0, COLS, ROWS, OFFSET).unwrap();
    let handle = ctx.register_chunk(desc, None).unwrap();
    assert_eq!(ctx.residency(handle).unwrap(), Residency::Cold);

    let x = random_vector(COLS, &mut rng);
    let hot: Vec<usize> = (0..ROWS).step_by(97).chain([ROWS - 1]).collect();
    let decisions = vec![RouterDecision::from_hot_units(ROWS, &hot).unwrap()];
    let layer = ctx.layer(&["L0.up"]).unwrap();

    let mut out = vec![f32::NAN; ROWS];
    let mut ws = Workspace::new(1 << 20).unwrap();
    let stats = ctx.sparse_matmul(&layer, &x, &decisions, &mut out, &mut ws).unwrap();
    assert_eq!(stats.active, hot.len());
    assert_eq!(stats.resolved_chunks, 1);
    assert_eq!(ctx.residency(handle).unwrap(), Residency::Resident);

    let row_bytes = QuantType::Q4_0.row_size(COLS).unwrap();
    for (unit, &got) in out.iter().enumerate() {
        if !decisions[0].is_hot(unit) {
            assert_eq!(got.to_bits(), 0.0f32.to_bits(), "unit {} should be zero", unit);
            continue;
        }
        let row = &weights[unit * row_bytes..(unit + 1) * row_bytes];
        let expect = reference_dot(QuantType::Q4_0, row, &x);
        assert!(
            (got - expect).abs() < 0.05 + 0.01 * expect.abs(),
            "unit {}: got {}, expected {}",
            unit,
            got,
            expect
        );
    }

    // second pass is served from the cache
    let mut again = vec![0.0; ROWS];
    ctx.sparse_matmul(&layer, &x, &decisions, &mut again, &mut ws).unwrap();
    assert_eq!(out, again);
    let cache = ctx.cache_stats();
    assert_eq!(cache.fetched, 1);
    assert_eq!(cache.hits, 1);
}

// ---------------------------------------------------------------------------
// Hot and cold paths agree
// ---------------------------------------------------------------------------

#[test]
fn test_pinned_and_offloaded_paths_agree() {
    const COLS: usize = 128;
    const ROWS: usize = 64;

    let mut rng = StdRng::seed_from_u64(11);
    let weights = random_q4_0(ROWS, COLS, 0.02, &mut rng);
    let ctx = file_context(RuntimeConfig::default().threads(3), 0, &weights);

    ctx.register_chunk(
        ChunkDescriptor::new("pinned", ChunkId::new(0, 0), QuantType::Q4_0, COLS, ROWS, 0).unwrap(),
        Some(weights.as_slice()),
    )
    .unwrap();
    ctx.register_chunk(
        ChunkDescriptor::new("paged", ChunkId::new(1, 0), QuantType::Q4_0, COLS, ROWS, 0).unwrap(),
        None,
    )
    .unwrap();

    let x = random_vector(3 * COLS, &mut rng);
    let router = Router::with_policies(SparsityConfig { threshold: 0.0, min_active: 4 }, ExpertRoutingConfig::default());
    let predictor = LowRankPredictor::random(COLS, ROWS, 8, 5);
    let decisions = router.route_batch(&predictor, &x).unwrap();

    let mut ws = Workspace::new(1 << 16).unwrap();
    let mut pinned = vec![0.0; 3 * ROWS];
    let mut paged = vec![1.0; 3 * ROWS];
    ctx.sparse_matmul(&ctx.layer(&["pinned"]).unwrap(), &x, &decisions, &mut pinned, &mut ws)
        .unwrap();
    ctx.sparse_matmul(&ctx.layer(&["paged"]).unwrap(), &x, &decisions, &mut paged, &mut ws)
        .unwrap();
    assert_eq!(pinned, paged);

    // the same rows split across a pinned and a paged chunk
    let half = ROWS / 2 * QuantType::Q4_0.row_size(COLS).unwrap();
    ctx.register_chunk(
        ChunkDescriptor::new("lo", ChunkId::new(2, 0), QuantType::Q4_0, COLS, ROWS / 2, 0).unwrap(),
        Some(&weights[..half]),
    )
    .unwrap();
    ctx.register_chunk(
        ChunkDescriptor::new("hi", ChunkId::new(2, 1), QuantType::Q4_0, COLS, ROWS / 2, half as u64).unwrap(),
        None,
    )
    .unwrap();
    let mut split = vec![2.0; 3 * ROWS];
    ctx.sparse_matmul(&ctx.layer(&["lo", "hi"]).unwrap(), &x, &decisions, &mut split, &mut ws)
        .unwrap();
    assert_eq!(pinned, split);
}

// ---------------------------------------------------------------------------
// Zero fill and failures
// ---------------------------------------------------------------------------

#[test]
fn test_scores_at_threshold_are_zero() {
    const COLS: usize = 64;
    const ROWS: usize = 16;

    let mut rng = StdRng::seed_from_u64(3);
    let w = random_vector(ROWS * COLS, &mut rng);
    let bytes = quantize_matrix(QuantType::Q8_0, &w, COLS).unwrap();
    let ctx = file_context(RuntimeConfig::default().threads(2), 0, &[]);
    ctx.register_chunk(
        ChunkDescriptor::new("L0.gate", ChunkId::new(0, 0), QuantType::Q8_0, COLS, ROWS, 0).unwrap(),
        Some(bytes.as_slice()),
    )
    .unwrap();

    let scores: Vec<f32> = (0..ROWS).map(|u| if u % 3 == 0 { 0.25 } else { 0.25 - (u % 2) as f32 }).collect();
    let gate = ThresholdGate::new(&scores, ROWS, 0.25).unwrap();
    let x = random_vector(COLS, &mut rng);
    let mut out = vec![f32::NAN; ROWS];
    let mut ws = Workspace::new(1 << 14).unwrap();
    let stats = ctx
        .sparse_matmul_with(&ctx.layer(&["L0.gate"]).unwrap(), &x, &gate, &mut out, &mut ws)
        .unwrap();

    assert_eq!(stats.active, 0);
    assert!((stats.sparsity() - 1.0).abs() < f32::EPSILON);
    assert!(out.iter().all(|v| v.to_bits() == 0.0f32.to_bits()));
}

#[test]
fn test_host_reports_small_workspace() {
    let weights = random_q4_0(32, 64, 0.05, &mut StdRng::seed_from_u64(1));
    let ctx = file_context(RuntimeConfig::default().threads(2), 0, &weights);
    let reg = ChunkRegistration {
        name: "L0.up",
        layer: 0,
        unit: 0,
        qtype: QuantType::Q4_0 as i32,
        ne: [64, 32, 1, 1],
        nb: [0; 4],
        byte_size: weights.len(),
        file_offset: 0,
        resident: None,
        layout_conversion: Some("q4_0_interleave"),
    };
    assert!(host_register_chunk(&ctx, &reg).is_ok());
    let handle = ctx.lookup("L0.up").unwrap();
    assert_eq!(
        ctx.descriptor(handle).unwrap().layout_conversion.as_deref(),
        Some("q4_0_interleave")
    );

    let mut out = vec![0.0; 32];
    let mut ws = Workspace::new(128).unwrap();
    let status = host_sparse_matmul(&ctx, &["L0.up"], &[0.5; 64], &[vec![1, 2]], &mut out, &mut ws);
    assert!(status.error);
    assert!(status.message.contains("The compute buffer is too small"));
    assert!(out.iter().all(|&v| v == 0.0));

    let mut ws = Workspace::new(1 << 14).unwrap();
    let status = host_sparse_matmul(&ctx, &["L0.up"], &[0.5; 64], &[vec![1, 2]], &mut out, &mut ws);
    assert!(status.is_ok(), "{}", status);
    assert_ne!(out[1], 0.0);
    assert_eq!(out[0], 0.0);
}

#[test]
fn test_unknown_chunk_is_never_skipped() {
    let ctx = file_context(RuntimeConfig::default().threads(2), 0, &[]);
    let err = ctx.layer(&["L7.down"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownIdentity);

    let status = host_load_all_chunks(&ctx);
    assert!(status.is_ok());
}

// ---------------------------------------------------------------------------
// Cache capacity
// ---------------------------------------------------------------------------

#[test]
fn test_capacity_bounded_cache_evicts_lru() {
    const COLS: usize = 32;
    const ROWS: usize = 8;

    let mut rng = StdRng::seed_from_u64(21);
    let weights = random_q4_0(3 * ROWS, COLS, 0.1, &mut rng);
    let chunk_bytes = weights.len() / 3;
    let ctx = file_context(RuntimeConfig::default().threads(2).max_cached_chunks(2), 0, &weights);

    let names = ["c0", "c1", "c2"];
    for (i, name) in names.iter().enumerate() {
        let desc = ChunkDescriptor::new(*name, ChunkId::new(0, i as u32), QuantType::Q4_0, COLS, ROWS, (i * chunk_bytes) as u64)
            .unwrap();
        ctx.register_chunk(desc, None).unwrap();
    }

    let x = random_vector(COLS, &mut rng);
    let decisions = vec![RouterDecision::dense(ROWS)];
    let mut out = vec![0.0; ROWS];
    let mut ws = Workspace::new(1 << 14).unwrap();
    for name in ["c0", "c1", "c0", "c2"] {
        let layer = ctx.layer(&[name]).unwrap();
        ctx.sparse_matmul(&layer, &x, &decisions, &mut out, &mut ws).unwrap();
    }

    let stats = ctx.cache_stats();
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.evicted, 1);
    assert_eq!(ctx.cache().len(), 2);
    // c1 was least recently used
    assert_eq!(ctx.residency(ctx.lookup("c1").unwrap()).unwrap(), Residency::Cold);
    assert_eq!(ctx.residency(ctx.lookup("c0").unwrap()).unwrap(), Residency::Resident);
}

// ---------------------------------------------------------------------------
// Fused kernels through the host boundary
// ---------------------------------------------------------------------------

#[test]
fn test_host_fused_ffn_and_moe() {
    const D_MODEL: usize = 32;
    const D_FF: usize = 16;

    let mut rng = StdRng::seed_from_u64(99);
    let ctx = file_context(RuntimeConfig::default().threads(2), 0, &[]);
    let mut mats = Vec::new();
    for (i, name) in ["e0.up", "e0.down", "e1.up", "e1.down"].iter().enumerate() {
        let w = random_vector(D_FF * D_MODEL, &mut rng);
        let bytes = quantize_matrix(QuantType::F32, &w, D_MODEL).unwrap();
        ctx.register_chunk(
            ChunkDescriptor::new(*name, ChunkId::new(0, i as u32), QuantType::F32, D_MODEL, D_FF, 0).unwrap(),
            Some(bytes.as_slice()),
        )
        .unwrap();
        mats.push(w);
    }

    let e0 = FfnChunks {
        up: &["e0.up"],
        gate: None,
        down: &["e0.down"],
        up_bias: None,
        activation: FfnActivation::Relu,
    };
    let e1 = FfnChunks {
        up: &["e1.up"],
        gate: None,
        down: &["e1.down"],
        up_bias: None,
        activation: FfnActivation::Relu,
    };

    let x = random_vector(D_MODEL, &mut rng);
    let expert_out = |up: &[f32], down: &[f32]| -> Vec<f32> {
        let mut out = vec![0.0f32; D_MODEL];
        for u in 0..D_FF {
            let r = u * D_MODEL..(u + 1) * D_MODEL;
            let h: f32 = up[r.clone()].iter().zip(&x).map(|(a, b)| a * b).sum::<f32>().max(0.0);
            for (o, d) in out.iter_mut().zip(&down[r]) {
                *o += h * d;
            }
        }
        out
    };

    let mut ws = Workspace::new(1 << 16).unwrap();
    let mut ffn_out = vec![0.0; D_MODEL];
    let all: Vec<usize> = (0..D_FF).collect();
    let status = host_fused_sparse_ffn(&ctx, &e0, &x, &[all], None, &mut ffn_out, &mut ws);
    assert!(status.is_ok(), "{}", status);
    let expect0 = expert_out(&mats[0], &mats[1]);
    for (g, e) in ffn_out.iter().zip(&expect0) {
        assert!((g - e).abs() < 1e-3);
    }

    // logits favour expert 1; with the default renormalisation both weights sum to 1
    let logits = [0.0, 1.0];
    let residual = vec![1.0; D_MODEL];
    let mut moe_out = vec![0.0; D_MODEL];
    let status = host_fused_sparse_moe(&ctx, &[e0, e1], &x, &logits, Some(&residual), &mut moe_out, &mut ws);
    assert!(status.is_ok(), "{}", status);

    let w1 = 1.0 / (1.0 + (-1.0f32).exp());
    let expect1 = expert_out(&mats[2], &mats[3]);
    for i in 0..D_MODEL {
        let expect = 1.0 + w1 * expect1[i] + (1.0 - w1) * expect0[i];
        assert!((moe_out[i] - expect).abs() < 1e-3, "{} vs {}", moe_out[i], expect);
    }
}
