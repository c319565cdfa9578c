//! Benchmarks for the resampler and the composed converter.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tono_convert::{
    DataConverter, DataConverterConfig, ResampleAlgorithm, Resampler, ResamplerConfig,
};
use tono_core::source::SourceFormat;

fn resampler_kernels(c: &mut Criterion) {
    let input: Vec<f32> = (0..4096).map(|i| libm::sinf(i as f32 * 0.01)).collect();
    let mut output = vec![0f32; 8192];

    let mut group = c.benchmark_group("resample_48k_to_44k1");
    for (name, algorithm) in [
        ("linear", ResampleAlgorithm::Linear),
        ("sinc16", ResampleAlgorithm::sinc_default()),
    ] {
        group.bench_function(name, |b| {
            let mut resampler = Resampler::new(ResamplerConfig {
                in_rate: 48_000,
                out_rate: 44_100,
                channels: 2,
                algorithm,
            })
            .unwrap();
            b.iter(|| {
                let result = resampler.process(black_box(&input), &mut output).unwrap();
                black_box(result);
            });
        });
    }
    group.finish();
}

fn full_pipeline(c: &mut Criterion) {
    let in_format = SourceFormat::f32(2, 48_000).unwrap();
    let out_format = SourceFormat::f32(1, 44_100).unwrap();
    let mut converter = DataConverter::new(DataConverterConfig::new(in_format, out_format)).unwrap();

    let input = vec![0u8; 4096 * 8];
    let mut output = vec![0u8; 4096 * 4];

    c.bench_function("convert_stereo48_to_mono44k1_4k", |b| {
        b.iter(|| {
            let result = converter.process(black_box(&input), &mut output).unwrap();
            black_box(result);
        });
    });
}

criterion_group!(benches, resampler_kernels, full_pipeline);
criterion_main!(benches);
