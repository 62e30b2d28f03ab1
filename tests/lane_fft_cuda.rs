mod common;

#[cfg(feature = "cuda")]
use common::{host_context, host_device, spread_bins, tone_lanes};
#[cfg(feature = "cuda")]
use radar_compute::cuda::{cuda_available, CudaAccelerator};
#[cfg(feature = "cuda")]
use radar_compute::{
    BatchConfig, ComputeContext, ContextConfig, ExecutionMode, JobParams, LaneFftProcessor,
};
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[test]
fn cuda_feature_off_noop() {
    #[cfg(not(feature = "cuda"))]
    {
        assert!(!radar_compute::cuda::cuda_available());
    }
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_lane_fft_matches_host() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[cuda_lane_fft_matches_host] skipped - no CUDA device");
        return Ok(());
    }

    let params = JobParams::new(16, 1024, 1024, 3);
    let bins = spread_bins(16, 1024);
    let data = tone_lanes(1024, params.transform_size(), &bins);

    let host_dev = host_device(1 << 30);
    let host_ctx = host_context(&host_dev, 2);
    let mut host = LaneFftProcessor::new(host_ctx, params.clone(), BatchConfig::default())?;
    let expected = host.process_slice(&data)?;

    let dev = Arc::new(CudaAccelerator::new(0)?);
    let ctx = ComputeContext::new(dev, ContextConfig::with_queues(3))?;
    let modes = [ExecutionMode::SingleShot, ExecutionMode::Sequential, ExecutionMode::Parallel];
    for mode in modes {
        let config = BatchConfig::default().with_mode(mode);
        let mut gpu = LaneFftProcessor::new(ctx.clone(), params.clone(), config)?;
        let got = gpu.process_slice(&data)?;
        assert_eq!(got.lanes.len(), expected.lanes.len());
        for (g, h) in got.lanes.iter().zip(&expected.lanes) {
            assert_eq!(g.peaks[0].bin_index, h.peaks[0].bin_index, "lane {} ({mode})", g.lane);
            let rel = (g.peaks[0].magnitude - h.peaks[0].magnitude).abs() / h.peaks[0].magnitude;
            let (gm, hm) = (g.peaks[0].magnitude, h.peaks[0].magnitude);
            assert!(rel < 1e-3, "lane {} magnitude {gm} vs {hm}", g.lane);
            assert!((g.sub_bin_offset - h.sub_bin_offset).abs() < 1e-2);
        }
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_capabilities_are_consistent() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[cuda_capabilities_are_consistent] skipped - no CUDA device");
        return Ok(());
    }
    use radar_compute::Accelerator;
    let dev = CudaAccelerator::new(0)?;
    let caps = dev.capabilities();
    assert!(!caps.fine_grain_buffer || caps.coarse_grain);
    assert!(!caps.fine_grain_system || caps.fine_grain_buffer);
    assert!(dev.info().max_work_group_size >= 256);
    Ok(())
}
