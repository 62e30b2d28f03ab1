//! Lane FFT orchestrator.
//!
//! Every batch runs the same three stages on one queue: pad the batch's
//! lanes into transform-sized slots, forward-transform them, and search the
//! spectrum of each lane for its strongest peaks. Stages are chained through
//! events. All batches write one lane-indexed result buffer, so the result
//! order never depends on how batches were spread over streams.

use super::config::BatchConfig;
use super::params::{FftJobResult, JobParams};
use super::peaks::{PeakRecord, PEAK_GROUP_SIZE};
use super::plan::{estimate_memory, memory_budget, stream_count, BatchDescriptor, BatchPlan};
use super::profiling::{BatchTiming, ProfilingReport};
use super::transform::{TransformPlan, TransformPlanBuilder};
use super::{PAD_KERNEL, PEAK_KERNEL};
use crate::context::ComputeContext;
use crate::device::{Accelerator, KernelArg, LaunchDims};
use crate::error::{ComputeError, Result};
use crate::memory::{MemoryBuffer, UsageHint};
use crate::program::{CompiledProgram, KernelInstance};
use crate::utilities::enums::{ExecutionMode, MemoryType};
use num_complex::Complex32;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const COMPLEX_BYTES: usize = std::mem::size_of::<Complex32>();

/// Scratch and kernel replicas owned by one stream.
struct StreamSlot<A: Accelerator> {
    queue: A::Queue,
    pad: KernelInstance<A>,
    peak: KernelInstance<A>,
    plan: TransformPlan<A>,
    padded: MemoryBuffer<A>,
    spectrum: MemoryBuffer<A>,
    lanes: usize,
    transform_size: usize,
}

struct BatchEvents<E> {
    fill: Option<E>,
    pad: E,
    transform: E,
    post: E,
}

impl<A: Accelerator> StreamSlot<A> {
    fn new(
        ctx: &ComputeContext<A>,
        program: &Arc<CompiledProgram<A>>,
        queue: A::Queue,
        lanes: usize,
        transform_size: usize,
    ) -> Result<Self> {
        let points = lanes * transform_size;
        let padded = ctx.buffers().create(points, MemoryType::ReadWrite, UsageHint::gpu_only())?;
        let spectrum = ctx.buffers().create(points, MemoryType::ReadWrite, UsageHint::gpu_only())?;
        let plan = TransformPlanBuilder::new(transform_size, lanes).build(ctx.device(), &queue)?;
        Ok(Self {
            pad: program.instantiate_kernel(PAD_KERNEL)?,
            peak: program.instantiate_kernel(PEAK_KERNEL)?,
            queue,
            plan,
            padded,
            spectrum,
            lanes,
            transform_size,
        })
    }

    #[inline]
    fn fits(&self, lanes: usize, transform_size: usize) -> bool {
        self.lanes == lanes && self.transform_size == transform_size
    }

    fn enqueue(
        &self,
        device: &A,
        input: &A::Mem,
        results: &A::Mem,
        params: &JobParams,
        batch: &BatchDescriptor,
        wait: &[A::Event],
    ) -> Result<BatchEvents<A::Event>> {
        let n = self.transform_size;
        let lanes = batch.lane_count;

        // Lanes past the batch are still transformed; keep them zero.
        let fill = if lanes < self.lanes {
            let offset = lanes * n * COMPLEX_BYTES;
            let len = (self.lanes - lanes) * n * COMPLEX_BYTES;
            Some(device.fill_zero(&self.queue, self.padded.device_mem(), offset, len, wait)?)
        } else {
            None
        };
        let pad_wait: Vec<A::Event> = match &fill {
            Some(ev) => vec![ev.clone()],
            None => wait.to_vec(),
        };

        let pad = device.launch(
            &self.queue,
            &self.pad,
            &[
                KernelArg::Mem(input),
                KernelArg::Mem(self.padded.device_mem()),
                KernelArg::U32(lanes as u32),
                KernelArg::U32(params.samples_per_lane as u32),
                KernelArg::U32(n as u32),
                KernelArg::U32(batch.start_lane as u32),
            ],
            LaunchDims::linear(lanes * n),
            &pad_wait,
        )?;

        let transform = self.plan.enqueue(
            &self.queue,
            self.padded.device_mem(),
            self.spectrum.device_mem(),
            std::slice::from_ref(&pad),
        )?;

        let post = device.launch(
            &self.queue,
            &self.peak,
            &[
                KernelArg::Mem(self.spectrum.device_mem()),
                KernelArg::Mem(results),
                KernelArg::U32(lanes as u32),
                KernelArg::U32(n as u32),
                KernelArg::U32(params.search_window as u32),
                KernelArg::U32(params.peak_count as u32),
                KernelArg::F32(params.sample_rate_hz),
                KernelArg::U32(batch.start_lane as u32),
            ],
            LaunchDims::grouped(lanes, PEAK_GROUP_SIZE),
            std::slice::from_ref(&transform),
        )?;

        Ok(BatchEvents { fill, pad, transform, post })
    }
}

/// Execution decision for one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub plan: BatchPlan,
    pub streams: usize,
}

pub struct LaneFftProcessor<A: Accelerator> {
    ctx: Arc<ComputeContext<A>>,
    program: Arc<CompiledProgram<A>>,
    params: JobParams,
    config: BatchConfig,
    single: Option<StreamSlot<A>>,
    parallel: Vec<StreamSlot<A>>,
    results: Option<MemoryBuffer<A>>,
    upload: Option<MemoryBuffer<A>>,
    last_profile: Option<ProfilingReport>,
    runs: u64,
}

impl<A: Accelerator> LaneFftProcessor<A> {
    pub fn new(
        ctx: Arc<ComputeContext<A>>,
        params: JobParams,
        config: BatchConfig,
    ) -> Result<Self> {
        params.validate()?;
        let source = ctx.device().lane_fft_program_source();
        let program = ctx.load_program(&source)?;
        info!(
            lanes = params.lane_count,
            samples = params.samples_per_lane,
            transform_size = params.transform_size(),
            "lane FFT processor ready"
        );
        Ok(Self {
            ctx,
            program,
            params,
            config: config.sanitized(),
            single: None,
            parallel: Vec::new(),
            results: None,
            upload: None,
            last_profile: None,
            runs: 0,
        })
    }

    #[inline]
    pub fn params(&self) -> &JobParams {
        &self.params
    }

    #[inline]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    #[inline]
    pub fn transform_size(&self) -> usize {
        self.params.transform_size()
    }

    #[inline]
    pub fn context(&self) -> &Arc<ComputeContext<A>> {
        &self.ctx
    }

    pub fn last_profile(&self) -> Option<&ProfilingReport> {
        self.last_profile.as_ref()
    }

    /// Replaces the job shape. Cached scratch is reallocated lazily on the
    /// next call when its size no longer matches.
    pub fn update_params(&mut self, params: JobParams) -> Result<()> {
        params.validate()?;
        if params.transform_size() != self.params.transform_size() {
            debug!(
                old = self.params.transform_size(),
                new = params.transform_size(),
                "transform size changed"
            );
        }
        self.params = params;
        Ok(())
    }

    pub fn set_config(&mut self, config: BatchConfig) {
        self.config = config.sanitized();
    }

    /// Runs the whole job in one batch.
    pub fn process(&mut self, input: &MemoryBuffer<A>) -> Result<FftJobResult> {
        let exec = ExecutionPlan {
            mode: ExecutionMode::SingleShot,
            plan: BatchPlan::single(self.params.lane_count),
            streams: 1,
        };
        self.execute(input, exec, None, Instant::now())
    }

    /// Picks single-shot, sequential or parallel execution and runs the job.
    pub fn process_auto(&mut self, input: &MemoryBuffer<A>) -> Result<FftJobResult> {
        let exec = self.plan_execution();
        self.execute(input, exec, None, Instant::now())
    }

    /// Uploads lane-major `data` and runs [`LaneFftProcessor::process_auto`].
    pub fn process_slice(&mut self, data: &[Complex32]) -> Result<FftJobResult> {
        let started = Instant::now();
        let len = self.params.input_len();
        if data.len() != len {
            return Err(ComputeError::InvalidInput(format!(
                "expected {len} samples ({} lanes x {}), got {}",
                self.params.lane_count,
                self.params.samples_per_lane,
                data.len()
            )));
        }
        let upload = match self.upload.take() {
            Some(buf) if buf.elements() == len => buf,
            _ => self.ctx.buffers().create(len, MemoryType::ReadOnly, UsageHint::gpu_only())?,
        };
        let outcome = upload
            .write_async(data, &[])
            .and_then(|ev| {
                let exec = self.plan_execution();
                self.execute(&upload, exec, Some(ev), started)
            });
        self.upload = Some(upload);
        outcome
    }

    /// Execution decision `process_auto` would take for the current shape.
    pub fn plan_execution(&self) -> ExecutionPlan {
        let params = &self.params;
        let cfg = &self.config;
        let lanes = params.lane_count;
        let global = self.ctx.info().global_memory;
        let pool = self.ctx.queues().size();

        let batched = |mode: ExecutionMode| {
            let plan = BatchPlan::new(lanes, cfg.batch_ratio);
            let streams = match mode {
                ExecutionMode::Parallel => {
                    let free = self.ctx.device().free_memory();
                    stream_count(params, &plan, cfg, global, free, pool)
                }
                _ => 1,
            };
            ExecutionPlan { mode, plan, streams }
        };

        match cfg.mode {
            ExecutionMode::SingleShot => ExecutionPlan {
                mode: ExecutionMode::SingleShot,
                plan: BatchPlan::single(lanes),
                streams: 1,
            },
            ExecutionMode::Sequential => batched(ExecutionMode::Sequential),
            ExecutionMode::Parallel => batched(ExecutionMode::Parallel),
            ExecutionMode::Auto => {
                let required = estimate_memory(params);
                let budget = memory_budget(global, cfg);
                if required <= budget {
                    return ExecutionPlan {
                        mode: ExecutionMode::SingleShot,
                        plan: BatchPlan::single(lanes),
                        streams: 1,
                    };
                }
                debug!(required, budget, lanes, "job exceeds memory budget, batching");
                let parallel = batched(ExecutionMode::Parallel);
                let multi_stream = cfg.max_streams > 1 && pool > 1;
                if multi_stream && parallel.plan.num_batches > 1 && parallel.streams > 1 {
                    parallel
                } else {
                    batched(ExecutionMode::Sequential)
                }
            }
        }
    }

    fn ensure_results(&mut self) -> Result<()> {
        let count = self.params.lane_count * self.params.peak_count;
        if matches!(&self.results, Some(buf) if buf.elements() == count) {
            return Ok(());
        }
        self.results = None;
        let buf = self.ctx.buffers().create_typed::<PeakRecord>(
            count,
            MemoryType::ReadWrite,
            UsageHint::gpu_only(),
        )?;
        self.results = Some(buf);
        Ok(())
    }

    fn ensure_single(&mut self, lanes: usize) -> Result<()> {
        let n = self.params.transform_size();
        if matches!(&self.single, Some(slot) if slot.fits(lanes, n)) {
            return Ok(());
        }
        if self.single.is_some() {
            debug!(lanes, transform_size = n, "reallocating single-stream scratch");
        }
        self.single = None;
        let queue = self.ctx.queues().queue(0)?;
        self.single = Some(StreamSlot::new(&self.ctx, &self.program, queue, lanes, n)?);
        Ok(())
    }

    fn ensure_parallel(&mut self, streams: usize, lanes: usize) -> Result<()> {
        let n = self.params.transform_size();
        if self.parallel.len() == streams && self.parallel.iter().all(|s| s.fits(lanes, n)) {
            return Ok(());
        }
        if !self.parallel.is_empty() {
            debug!(streams, lanes, transform_size = n, "reallocating per-stream scratch");
        }
        self.parallel.clear();
        let pool = self.ctx.queues().size().max(1);
        for s in 0..streams {
            let queue = self.ctx.queues().queue(s % pool)?;
            self.parallel.push(StreamSlot::new(&self.ctx, &self.program, queue, lanes, n)?);
        }
        Ok(())
    }

    fn execute(
        &mut self,
        input: &MemoryBuffer<A>,
        exec: ExecutionPlan,
        upload: Option<A::Event>,
        started: Instant,
    ) -> Result<FftJobResult> {
        let params = self.params.clone();
        let needed = params.input_len() * COMPLEX_BYTES;
        if input.size_bytes() < needed {
            return Err(ComputeError::Capacity { requested: needed, capacity: input.size_bytes() });
        }
        info!(
            mode = %exec.mode,
            batches = exec.plan.num_batches,
            batch_lanes = exec.plan.max_batch,
            streams = exec.streams,
            "lane FFT execution"
        );

        self.ensure_results()?;
        let parallel = exec.mode == ExecutionMode::Parallel;
        if parallel {
            self.ensure_parallel(exec.streams, exec.plan.max_batch)?;
        } else {
            self.ensure_single(exec.plan.max_batch)?;
        }

        let device = self.ctx.device().clone();
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| ComputeError::Device("result buffer missing".into()))?;
        let slots: Vec<&StreamSlot<A>> = if parallel {
            self.parallel.iter().collect()
        } else {
            self.single.iter().collect()
        };
        let streams = slots.len();
        if streams == 0 {
            return Err(ComputeError::Device("no scratch slots allocated".into()));
        }

        let initial: Vec<A::Event> = upload.iter().cloned().collect();
        let mut chain: Vec<Option<A::Event>> = vec![None; streams];
        let mut issued: Vec<(BatchDescriptor, BatchEvents<A::Event>)> =
            Vec::with_capacity(exec.plan.num_batches);

        for batch in exec.plan.batches(streams) {
            let slot = slots[batch.stream];
            let wait: Vec<A::Event> = match &chain[batch.stream] {
                Some(prev) => vec![prev.clone()],
                None => initial.clone(),
            };
            let enqueued = slot.enqueue(
                &device,
                input.device_mem(),
                results.device_mem(),
                &params,
                &batch,
                &wait,
            );
            match enqueued {
                Ok(events) => {
                    chain[batch.stream] = Some(events.post.clone());
                    issued.push((batch, events));
                }
                Err(e) => {
                    let pending: Vec<A::Event> =
                        issued.iter().map(|(_, ev)| ev.post.clone()).collect();
                    if let Err(drain) = device.wait(&pending) {
                        debug!(error = %drain, "in-flight batch failed while aborting");
                    }
                    return Err(e);
                }
            }
        }
        for slot in &slots {
            device.flush(&slot.queue)?;
        }

        // Single join point for every stream.
        let finals: Vec<A::Event> = issued.iter().map(|(_, ev)| ev.post.clone()).collect();
        device.wait(&finals)?;

        let ms = |ev: &A::Event| device.event_timing(ev).map(|t| t.duration_ms()).unwrap_or(0.0);
        let mut report = ProfilingReport { mode: Some(exec.mode), streams, ..Default::default() };
        if let Some(ev) = &upload {
            report.upload_ms = ms(ev);
        }
        for (batch, ev) in &issued {
            report.push_batch(BatchTiming {
                index: batch.index,
                start_lane: batch.start_lane,
                lane_count: batch.lane_count,
                stream: batch.stream,
                pad_ms: ev.fill.as_ref().map(&ms).unwrap_or(0.0) + ms(&ev.pad),
                transform_ms: ms(&ev.transform),
                post_ms: ms(&ev.post),
            });
        }

        let download_started = Instant::now();
        let records: Vec<PeakRecord> =
            results.read_partial(0, params.lane_count * params.peak_count)?;
        report.download_ms = download_started.elapsed().as_secs_f64() * 1e3;
        report.total_ms = started.elapsed().as_secs_f64() * 1e3;

        let result = FftJobResult::from_records(&params, &records);
        self.last_profile = Some(report);
        self.runs += 1;
        Ok(result)
    }

    /// Human-readable report of the last run.
    pub fn profiling_summary(&self) -> String {
        let p = &self.params;
        let mut out = format!(
            "Lane FFT [{}{}{}] {} lanes x {} samples, transform {} , window {}, {} peaks, runs {}",
            p.task_id,
            if p.task_id.is_empty() || p.module_name.is_empty() { "" } else { "/" },
            p.module_name,
            p.lane_count,
            p.samples_per_lane,
            p.transform_size(),
            p.search_window,
            p.peak_count,
            self.runs
        );
        match &self.last_profile {
            Some(r) => {
                out.push('\n');
                out.push_str(&r.to_string());
            }
            None => out.push_str("\n(no runs yet)"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::device::host::{HostAccelerator, HostConfig};
    use paste::paste;
    use std::f32::consts::PI;

    fn context(global: usize, queues: usize) -> Arc<ComputeContext<HostAccelerator>> {
        let dev = Arc::new(HostAccelerator::new(HostConfig::default().with_global_memory(global)));
        ComputeContext::new(dev, ContextConfig::with_queues(queues)).unwrap()
    }

    fn processor(
        ctx: Arc<ComputeContext<HostAccelerator>>,
        params: JobParams,
    ) -> LaneFftProcessor<HostAccelerator> {
        LaneFftProcessor::new(ctx, params, BatchConfig::default()).unwrap()
    }

    /// Lane `l` carries one complex tone at transform bin `bins[l]`.
    fn tones(samples: usize, tsize: usize, bins: &[usize]) -> Vec<Complex32> {
        let mut out = Vec::with_capacity(samples * bins.len());
        for &bin in bins {
            for t in 0..samples {
                let ph = 2.0 * PI * bin as f32 * t as f32 / tsize as f32;
                out.push(Complex32::new(ph.cos(), ph.sin()));
            }
        }
        out
    }

    #[test]
    fn auto_selects_single_shot_when_job_fits() {
        let ctx = context(1 << 30, 2);
        let p = processor(ctx, JobParams::new(4, 1024, 1024, 3));
        let exec = p.plan_execution();
        assert_eq!(exec.mode, ExecutionMode::SingleShot);
        assert_eq!(exec.plan.num_batches, 1);
    }

    #[test]
    fn auto_batches_when_job_does_not_fit() {
        // 64 lanes x 1024 samples needs ~3.3 MiB; budget is 1 MiB.
        let ctx = context(2 << 20, 3);
        let p = processor(ctx.clone(), JobParams::new(64, 1024, 512, 3));
        let exec = p.plan_execution();
        assert!(exec.mode.is_batched());
        assert!(exec.plan.num_batches > 1);

        let p = LaneFftProcessor::new(
            ctx,
            JobParams::new(64, 1024, 512, 3),
            BatchConfig::default().with_max_streams(1),
        )
        .unwrap();
        assert_eq!(p.plan_execution().mode, ExecutionMode::Sequential);
    }

    #[test]
    fn auto_batches_small_job_over_budget() {
        // 8 lanes need 2 MiB against a 1 MiB budget.
        let ctx = context(2 << 20, 2);
        let params = JobParams::new(8, 4096, 8192, 3);
        assert!(estimate_memory(&params) > memory_budget(2 << 20, &BatchConfig::default()));
        let p = LaneFftProcessor::new(ctx, params, BatchConfig::default()).unwrap();
        let exec = p.plan_execution();
        assert!(exec.mode.is_batched(), "{exec:?}");
        assert!(exec.plan.num_batches > 1);
    }

    #[test]
    fn wrong_input_length_is_rejected() {
        let ctx = context(1 << 26, 1);
        let mut p = processor(ctx, JobParams::new(2, 64, 64, 3));
        let short = p.process_slice(&[Complex32::new(0.0, 0.0); 10]);
        assert!(matches!(short, Err(ComputeError::InvalidInput(_))));
    }

    #[test]
    fn undersized_input_buffer_is_capacity_error() {
        let ctx = context(1 << 26, 1);
        let mut p = processor(ctx.clone(), JobParams::new(2, 64, 64, 3));
        let small = ctx.buffers().create(64, MemoryType::ReadOnly, UsageHint::gpu_only()).unwrap();
        assert!(matches!(p.process(&small), Err(ComputeError::Capacity { .. })));
    }

    macro_rules! mode_finds_tones {
        ($($mode:ident),*) => {
            paste! {
                $(
                    #[test]
                    fn [<finds_tones_ $mode:snake>]() {
                        let ctx = context(1 << 28, 3);
                        let bins: Vec<usize> = (0..12).map(|l| 10 + 7 * l).collect();
                        let params = JobParams::new(bins.len(), 128, 256, 3);
                        let cfg = BatchConfig::default()
                            .with_mode(ExecutionMode::$mode)
                            .with_batch_ratio(0.25);
                        let mut p = LaneFftProcessor::new(ctx, params, cfg).unwrap();
                        let r = p.process_slice(&tones(128, 256, &bins)).unwrap();
                        assert_eq!(r.lanes.len(), bins.len());
                        for (lane, bin) in r.lanes.iter().zip(&bins) {
                            assert_eq!(lane.peaks[0].bin_index, *bin);
                            let peaks = &lane.peaks;
                            assert!(peaks.windows(2).all(|w| w[0].magnitude >= w[1].magnitude));
                        }
                        let prof = p.last_profile().unwrap();
                        assert_eq!(prof.mode, Some(ExecutionMode::$mode));
                        let covered: usize = prof.batches.iter().map(|b| b.lane_count).sum();
                        assert_eq!(covered, bins.len());
                    }
                )*
            }
        };
    }

    mode_finds_tones!(SingleShot, Sequential, Parallel);

    #[test]
    fn scratch_is_reused_across_calls() {
        let ctx = context(1 << 28, 2);
        let dev = ctx.device().clone();
        let params = JobParams::new(6, 64, 128, 3);
        let mut p = LaneFftProcessor::new(ctx, params, BatchConfig::default()).unwrap();
        let data = tones(64, 128, &[3, 5, 7, 9, 11, 13]);
        p.process_slice(&data).unwrap();
        let after_first = dev.memory_stats().allocations;
        p.process_slice(&data).unwrap();
        assert_eq!(dev.memory_stats().allocations, after_first);

        p.update_params(JobParams::new(6, 128, 128, 3)).unwrap();
        p.process_slice(&tones(128, 256, &[3, 5, 7, 9, 11, 13])).unwrap();
        assert!(dev.memory_stats().allocations > after_first);
    }

    #[test]
    fn summary_mentions_shape() {
        let ctx = context(1 << 26, 1);
        let mut p = LaneFftProcessor::new(
            ctx,
            JobParams::new(2, 32, 64, 3).with_task("T", "M"),
            BatchConfig::default(),
        )
        .unwrap();
        assert!(p.profiling_summary().contains("no runs yet"));
        p.process_slice(&tones(32, 64, &[4, 8])).unwrap();
        let s = p.profiling_summary();
        assert!(s.contains("[T/M]"));
        assert!(s.contains("total"));
    }
}
