mod common;

use common::{host_context, host_device, spread_bins, tone_lanes};
use num_complex::Complex32;
use radar_compute::device::DeviceCapabilities;
use radar_compute::{
    BatchConfig, ComputeContext, ContextConfig, HostAccelerator, HostConfig, JobParams,
    LaneFftProcessor, MemoryStrategy, MemoryType, UsageHint,
};
use std::error::Error;
use std::sync::Arc;

#[test]
fn shared_memory_input_matches_explicit_upload() -> Result<(), Box<dyn Error>> {
    let dev = host_device(1 << 30);
    let ctx = host_context(&dev, 2);
    let params = JobParams::new(6, 256, 256, 3);
    let data = tone_lanes(256, params.transform_size(), &spread_bins(6, 256));
    let mut processor = LaneFftProcessor::new(ctx.clone(), params, BatchConfig::default())?;
    let expected = processor.process_slice(&data)?;

    let grains = [
        MemoryStrategy::SvmCoarseGrain,
        MemoryStrategy::SvmFineGrain,
        MemoryStrategy::SvmFineGrainSystem,
    ];
    for strategy in grains {
        let buf = ctx.buffers().create_with_strategy(data.len(), MemoryType::ReadOnly, strategy)?;
        assert_eq!(buf.strategy(), strategy);
        buf.write(&data)?;
        assert!(!buf.is_mapped());
        assert_eq!(processor.process(&buf)?, expected, "{strategy}");
    }
    Ok(())
}

#[test]
fn device_without_svm_only_hands_out_regular_buffers() -> Result<(), Box<dyn Error>> {
    let bare = HostConfig::default().with_capabilities(DeviceCapabilities::none());
    let dev = Arc::new(HostAccelerator::new(bare));
    let ctx = ComputeContext::new(dev, ContextConfig::with_queues(1))?;
    let hints = [
        UsageHint::default(),
        UsageHint::frequent_transfer(),
        UsageHint::requires_atomics(),
    ];
    for hint in hints {
        let buf = ctx.buffers().create(1 << 20, MemoryType::ReadWrite, hint)?;
        assert!(!buf.is_svm());
    }
    let fine = MemoryStrategy::SvmFineGrain;
    let svm = ctx.buffers().create_with_strategy(1024, MemoryType::ReadWrite, fine)?;
    assert_eq!(svm.strategy(), MemoryStrategy::RegularBuffer);

    let stats = ctx.buffers().statistics();
    assert_eq!(stats.total_buffers, 4);
    assert_eq!(stats.svm_buffers, 0);
    assert_eq!(stats.fallbacks, 1);
    Ok(())
}

#[test]
fn rejected_shared_allocation_falls_back_and_still_processes() -> Result<(), Box<dyn Error>> {
    let dev = Arc::new(HostAccelerator::new(HostConfig::default().with_svm_fail_at(4096)));
    let ctx = ComputeContext::new(dev.clone(), ContextConfig::with_queues(2))?;
    let params = JobParams::new(4, 128, 128, 3);
    let data = tone_lanes(128, params.transform_size(), &spread_bins(4, 128));

    let coarse = MemoryStrategy::SvmCoarseGrain;
    let buf = ctx.buffers().create_with_strategy(data.len(), MemoryType::ReadOnly, coarse)?;
    assert!(!buf.is_svm());
    assert_eq!(ctx.buffers().statistics().fallbacks, 1);
    assert_eq!(dev.memory_stats().rejected, 1);

    buf.write(&data)?;
    let mut processor = LaneFftProcessor::new(ctx, params, BatchConfig::default())?;
    let result = processor.process(&buf)?;
    assert_eq!(result.lanes.len(), 4);
    Ok(())
}

#[test]
fn partial_reads_and_scoped_maps_see_device_writes() -> Result<(), Box<dyn Error>> {
    let dev = host_device(1 << 26);
    let ctx = host_context(&dev, 1);
    let data: Vec<Complex32> = (0..64).map(|i| Complex32::new(i as f32, -(i as f32))).collect();
    let coarse = MemoryStrategy::SvmCoarseGrain;
    let buf = ctx.buffers().create_with_strategy(64, MemoryType::ReadWrite, coarse)?;
    buf.write(&data)?;

    let tail: Vec<Complex32> = buf.read_partial(60, 4)?;
    assert_eq!(tail, data[60..]);

    {
        let map = buf.scoped_map()?;
        assert!(buf.is_mapped());
        map.with_bytes(|bytes| {
            let view: &mut [Complex32] = bytemuck::cast_slice_mut(bytes);
            view[0] = Complex32::new(42.0, 0.0);
        })?;
    }
    assert!(!buf.is_mapped());
    let back: Vec<Complex32> = buf.read()?;
    assert_eq!(back[0], Complex32::new(42.0, 0.0));
    assert_eq!(back[1..], data[1..]);
    Ok(())
}
