use criterion::{Criterion, criterion_group, criterion_main};
use lamafill::{
    config::RefinerConfig,
    pipeline::{refine::build_pyramid, tensor::pad_symmetric},
};
use ndarray::Array3;

fn bench_pyramid(c: &mut Criterion) {
    let mut group = c.benchmark_group("refine_pyramid");
    let config = RefinerConfig {
        min_side: 128,
        ..RefinerConfig::default()
    };
    for &side in &[256usize, 512, 1024] {
        let image = Array3::from_elem((3, side, side), 0.5f32);
        let mask = Array3::zeros((1, side, side));
        group.bench_function(format!("pyramid_{side}"), |b| {
            b.iter(|| build_pyramid(image.clone(), mask.clone(), &config))
        });
        group.bench_function(format!("pad_{side}"), |b| {
            b.iter(|| pad_symmetric(image.view(), side + 7, side + 7))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pyramid);
criterion_main!(benches);
