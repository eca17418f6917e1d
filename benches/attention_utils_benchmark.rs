#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use rust_tensor_parallel::gpt_neo::attention_utils::{
    create_local_attention_mask, look_back, unfold,
};
use rust_tensor_parallel::gpt_neo::get_block_length_and_num_blocks;
use tch::kind::Kind;
use tch::{Device, Tensor};

fn bench_block_resolution(c: &mut Criterion) {
    c.bench_function("Block length resolution", |b| {
        b.iter(|| get_block_length_and_num_blocks(black_box(2048), black_box(256)))
    });
}

fn bench_unfold(c: &mut Criterion) {
    let device = Device::cuda_if_available();
    let input = Tensor::rand([4, 2304, 768], (Kind::Float, device));

    let _ = unfold(&input, 1, 512, 256);
    c.bench_function("Indexed unfold", |b| {
        b.iter(|| unfold(black_box(&input), 1, 512, 256))
    });
    c.bench_function("Native unfold", |b| {
        b.iter(|| black_box(&input).unfold(1, 512, 256))
    });
}

fn bench_local_attention_inputs(c: &mut Criterion) {
    let device = Device::cuda_if_available();
    let keys = Tensor::rand([4, 2048, 768], (Kind::Float, device));
    let attention_mask = Tensor::ones([4, 2048], (Kind::Int64, device));

    c.bench_function("Look back", |b| {
        b.iter(|| look_back(black_box(&keys), 128, 256, true))
    });
    c.bench_function("Local attention mask", |b| {
        b.iter(|| create_local_attention_mask(4, 2048, 256, device, Some(&attention_mask)))
    });
}

criterion_group! {
name = benches;
config = Criterion::default().sample_size(50);
targets = bench_block_resolution, bench_unfold, bench_local_attention_inputs
}

criterion_main!(benches);
