use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use num_complex::Complex32;
use radar_compute::{
    BatchConfig, ComputeContext, ContextConfig, ExecutionMode, HostAccelerator, HostConfig,
    JobParams, LaneFftProcessor,
};
use std::f32::consts::PI;
use std::sync::Arc;

fn gen_lanes(lanes: usize, samples: usize, transform_size: usize) -> Vec<Complex32> {
    let mut v = Vec::with_capacity(lanes * samples);
    for l in 0..lanes {
        let bin = 3 + (l * 37) % (samples - 6);
        for t in 0..samples {
            let ph = 2.0 * PI * ((bin * t) % transform_size) as f32 / transform_size as f32;
            v.push(Complex32::new(ph.cos(), ph.sin()));
        }
    }
    v
}

fn bench_host_modes(c: &mut Criterion) {
    let dev = Arc::new(HostAccelerator::new(HostConfig::default()));
    let ctx = match ComputeContext::new(dev, ContextConfig::with_queues(3)) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("[bench] host context failed: {e}");
            return;
        }
    };
    let mut group = c.benchmark_group("lane_fft_host");
    for &(lanes, samples) in &[(16usize, 1024usize), (64, 1024), (256, 512)] {
        let params = JobParams::new(lanes, samples, samples, 3);
        let data = gen_lanes(lanes, samples, params.transform_size());
        let modes = [ExecutionMode::SingleShot, ExecutionMode::Sequential, ExecutionMode::Parallel];
        for mode in modes {
            let config = BatchConfig::default().with_mode(mode);
            let created = LaneFftProcessor::new(ctx.clone(), params.clone(), config);
            let Ok(mut processor) = created else {
                continue;
            };
            let id = BenchmarkId::new(mode.to_string(), format!("{lanes}x{samples}"));
            group.bench_with_input(id, &data, |b, data| {
                b.iter(|| {
                    let lanes = processor.process_slice(data).map(|r| r.lanes.len());
                    black_box(lanes.unwrap_or(0))
                })
            });
        }
    }
    group.finish();
}

#[cfg(feature = "cuda")]
fn bench_cuda(c: &mut Criterion) {
    use radar_compute::cuda::{cuda_available, CudaAccelerator};
    if !cuda_available() {
        eprintln!("[bench] skipping CUDA (no device)");
        return;
    }
    let Ok(dev) = CudaAccelerator::new(0) else { return };
    let Ok(ctx) = ComputeContext::new(Arc::new(dev), ContextConfig::with_queues(3)) else { return };
    let mut group = c.benchmark_group("lane_fft_cuda");
    let params = JobParams::new(256, 1024, 1024, 3);
    let data = gen_lanes(256, 1024, params.transform_size());
    let Ok(mut processor) = LaneFftProcessor::new(ctx, params, BatchConfig::default()) else {
        return;
    };
    group.bench_function("auto_256x1024", |b| {
        b.iter(|| black_box(processor.process_slice(&data).map(|r| r.lanes.len()).unwrap_or(0)))
    });
    group.finish();
}

#[cfg(feature = "cuda")]
criterion_group!(benches, bench_host_modes, bench_cuda);
#[cfg(not(feature = "cuda"))]
criterion_group!(benches, bench_host_modes);
criterion_main!(benches);
