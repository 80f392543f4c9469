use criterion::{Criterion, black_box, criterion_group, criterion_main};
use half::bf16;
use woq_core::simd::{self, Level};
use woq_core::tensor::Tensor;
use woq_core::{add_rms_norm_with_sum, rms_norm, rotary_embedding};

const HIDDEN: usize = 4096;
const TOKENS: usize = 16;

fn hidden_states() -> Vec<f32> {
    (0..TOKENS * HIDDEN)
        .map(|i| ((i % 97) as f32) * 0.02 - 0.97)
        .collect()
}

fn bench_rms_norm(c: &mut Criterion) {
    let values = hidden_states();
    let x32 = Tensor::from_f32([TOKENS, HIDDEN], values.clone()).unwrap();
    let x16 = Tensor::from_elements([TOKENS, HIDDEN], values.iter().map(|&v| bf16::from_f32(v)).collect()).unwrap();
    let w = Tensor::from_f32([HIDDEN], vec![1.0; HIDDEN]).unwrap();

    c.bench_function("rms_norm f32 (dispatch)", |b| {
        b.iter(|| rms_norm(black_box(&x32), &w, 1e-6).unwrap())
    });
    c.bench_function("rms_norm bf16 (dispatch)", |b| {
        b.iter(|| rms_norm(black_box(&x16), &w, 1e-6).unwrap())
    });
    c.bench_function("add_rms_norm bf16 (dispatch)", |b| {
        b.iter(|| add_rms_norm_with_sum(black_box(&x16), &x16, &w, 1e-6).unwrap())
    });
}

fn bench_rope(c: &mut Criterion) {
    let (heads, head_size, rotary) = (32usize, 128usize, 64usize);
    let half = rotary / 2;
    let positions: Vec<usize> = (0..TOKENS).collect();
    let angles: Vec<f32> = (0..TOKENS * half).map(|i| (i % half) as f32 * 0.1 + (i / half) as f32).collect();
    let cos = Tensor::from_f32([TOKENS, half], angles.iter().map(|a| a.cos()).collect()).unwrap();
    let sin = Tensor::from_f32([TOKENS, half], angles.iter().map(|a| a.sin()).collect()).unwrap();
    let x = Tensor::from_f32([TOKENS, heads, head_size], hidden_states()[..TOKENS * heads * head_size].to_vec()).unwrap();

    c.bench_function("rope f32 (dispatch)", |b| {
        b.iter(|| rotary_embedding(black_box(&x), &positions, &cos, &sin, rotary, half).unwrap())
    });

    // reference paths; the level is process-wide, so this runs last
    simd::force_level(Level::Scalar);
    c.bench_function("rope f32 (scalar)", |b| {
        b.iter(|| rotary_embedding(black_box(&x), &positions, &cos, &sin, rotary, half).unwrap())
    });
}

criterion_group!(benches, bench_rms_norm, bench_rope);
criterion_main!(benches);
