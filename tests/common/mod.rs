#![allow(dead_code)]

use num_complex::Complex32;
use radar_compute::{ComputeContext, ContextConfig, HostAccelerator, HostConfig};
use std::f32::consts::PI;
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Routes runtime logs to the test writer; `RUST_LOG` picks the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn host_device(global: usize) -> Arc<HostAccelerator> {
    init_tracing();
    Arc::new(HostAccelerator::new(HostConfig::default().with_global_memory(global)))
}

pub fn host_context(
    dev: &Arc<HostAccelerator>,
    queues: usize,
) -> Arc<ComputeContext<HostAccelerator>> {
    ComputeContext::new(dev.clone(), ContextConfig::with_queues(queues)).expect("host context")
}

/// Lane-major samples; lane `l` is a unit complex tone that lands exactly on
/// transform bin `bins[l]`.
pub fn tone_lanes(samples: usize, transform_size: usize, bins: &[usize]) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(samples * bins.len());
    for &bin in bins {
        for t in 0..samples {
            let ph = 2.0 * PI * ((bin * t) % transform_size) as f32 / transform_size as f32;
            out.push(Complex32::new(ph.cos(), ph.sin()));
        }
    }
    out
}

/// Tone bins spread over `window` so every lane differs.
pub fn spread_bins(lanes: usize, window: usize) -> Vec<usize> {
    (0..lanes).map(|l| 2 + (l * 37) % (window - 4)).collect()
}
