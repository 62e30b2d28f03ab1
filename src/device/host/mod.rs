//! Software accelerator.
//!
//! Implements the full [`Accelerator`] contract on the CPU: every queue is a
//! worker thread executing commands in submission order, events carry real
//! profiling timestamps, allocations are counted and bounded by a configured
//! global memory size, and shared-virtual-memory placements enforce the
//! map/unmap protocol for coarse-grain regions. Kernels are native Rust
//! functions resolved by entry-point name when a program is "built".

pub mod kernels;
pub mod memory;
pub mod queue;
pub mod transform;

pub use kernels::{HostArg, HostKernelFn, HostLaunch, PAD_KERNEL, PEAK_KERNEL};
pub use memory::{HostAllocation, HostMem, HostMemoryStats};
pub use queue::{HostEvent, HostQueue};
pub use transform::HostPlan;

use self::kernels::{builtin_kernels, parse_entries, HOST_LANE_FFT_SOURCE};
use self::memory::MemoryLedger;
use self::queue::DeviceClock;
use crate::device::{
    Accelerator, DeviceCapabilities, DeviceInfo, EventTiming, KernelArg, LaunchDims, Placement,
    TransformDesc,
};
use crate::error::{ComputeError, Result};
use crate::utilities::enums::MemoryType;
use crate::utilities::helpers::detect_parallelism;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct HostConfig {
    pub name: String,
    pub global_memory: usize,
    pub local_memory: usize,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    pub capabilities: DeviceCapabilities,
    /// SVM allocations of at least this many bytes are rejected even though
    /// the grain is advertised.
    pub svm_fail_at: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            global_memory: 1 << 30,
            local_memory: 64 << 10,
            compute_units: detect_parallelism() as u32,
            max_work_group_size: 1024,
            capabilities: DeviceCapabilities::full(),
            svm_fail_at: None,
        }
    }
}

impl HostConfig {
    pub fn with_global_memory(mut self, bytes: usize) -> Self {
        self.global_memory = bytes;
        self
    }

    pub fn with_capabilities(mut self, caps: DeviceCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_svm_fail_at(mut self, bytes: usize) -> Self {
        self.svm_fail_at = Some(bytes);
        self
    }
}

/// Program built by the host backend: the resolved entry points.
pub struct HostProgram {
    id: u64,
    entries: HashMap<String, Arc<HostKernelFn>>,
}

impl HostProgram {
    pub fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostProgram")
            .field("id", &self.id)
            .field("entries", &self.entry_names())
            .finish()
    }
}

#[derive(Clone)]
pub struct HostKernel {
    id: u64,
    program_id: u64,
    name: Arc<str>,
    func: Arc<HostKernelFn>,
}

impl HostKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel").field("id", &self.id).field("name", &self.name).finish()
    }
}

/// Object-lifetime counters beyond memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostObjectStats {
    pub programs_built: u64,
    pub programs_released: u64,
    pub kernels_created: u64,
    pub kernels_released: u64,
    /// Programs released while kernels created from them were still alive.
    pub early_program_releases: u64,
    pub plans_created: u64,
    pub plans_released: u64,
    pub launches: u64,
}

#[derive(Default)]
struct ObjectLedger {
    stats: HostObjectStats,
    live_kernels: HashMap<u64, usize>,
}

pub struct HostAccelerator {
    config: HostConfig,
    clock: Arc<DeviceClock>,
    memory: Mutex<MemoryLedger>,
    objects: Mutex<ObjectLedger>,
    registry: RwLock<HashMap<String, Arc<HostKernelFn>>>,
    failing: RwLock<HashSet<String>>,
    next_queue: AtomicUsize,
    next_object: AtomicU64,
}

impl fmt::Debug for HostAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAccelerator")
            .field("name", &self.config.name)
            .field("global_memory", &self.config.global_memory)
            .finish()
    }
}

impl Default for HostAccelerator {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl HostAccelerator {
    pub fn new(config: HostConfig) -> Self {
        let registry = builtin_kernels().into_iter().map(|(n, f)| (n.to_string(), f)).collect();
        Self {
            memory: Mutex::new(MemoryLedger::new(config.global_memory)),
            config,
            clock: Arc::new(DeviceClock::new()),
            objects: Mutex::new(ObjectLedger::default()),
            registry: RwLock::new(registry),
            failing: RwLock::new(HashSet::new()),
            next_queue: AtomicUsize::new(0),
            next_object: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Makes `name` resolvable by `.entry name` in program sources.
    pub fn register_kernel<F>(&self, name: &str, func: F)
    where
        F: Fn(&HostLaunch) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.registry.write().insert(name.to_string(), Arc::new(func));
    }

    /// Launches of `name` fail when they execute, and so do their dependents.
    pub fn inject_kernel_failure(&self, name: &str) {
        self.failing.write().insert(name.to_string());
    }

    pub fn clear_injected_failures(&self) {
        self.failing.write().clear();
    }

    pub fn memory_stats(&self) -> HostMemoryStats {
        self.memory.lock().stats()
    }

    pub fn object_stats(&self) -> HostObjectStats {
        self.objects.lock().stats
    }

    /// Direct access to an allocation, for inspection in tests and tools.
    pub fn allocation(&self, mem: &HostMem) -> Result<Arc<HostAllocation>> {
        self.memory.lock().resolve(mem)
    }

    fn next_id(&self) -> u64 {
        self.next_object.fetch_add(1, Ordering::Relaxed)
    }

    fn resolve(&self, mem: &HostMem) -> Result<Arc<HostAllocation>> {
        self.memory.lock().resolve(mem)
    }

    fn check_range(alloc: &HostAllocation, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= alloc.len() => Ok(()),
            _ => Err(ComputeError::Capacity {
                requested: offset.saturating_add(len),
                capacity: alloc.len(),
            }),
        }
    }
}

impl Accelerator for HostAccelerator {
    type Queue = HostQueue;
    type Event = HostEvent;
    type Mem = HostMem;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Plan = HostPlan;

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.config.name.clone(),
            vendor: "radar_compute".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            global_memory: self.config.global_memory,
            local_memory: self.config.local_memory,
            compute_units: self.config.compute_units,
            max_work_group_size: self.config.max_work_group_size,
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.config.capabilities
    }

    fn free_memory(&self) -> Option<usize> {
        Some(self.memory.lock().free_bytes())
    }

    fn create_queue(&self) -> Result<HostQueue> {
        let id = self.next_queue.fetch_add(1, Ordering::Relaxed);
        HostQueue::spawn(id, self.clock.clone())
    }

    fn flush(&self, _queue: &HostQueue) -> Result<()> {
        // Commands are handed to the worker on submission.
        Ok(())
    }

    fn finish(&self, queue: &HostQueue) -> Result<()> {
        let ev = queue.submit("finish", &[], Box::new(|| Ok(())))?;
        ev.wait().map_err(ComputeError::Device)
    }

    fn marker(&self, queue: &HostQueue, wait: &[HostEvent]) -> Result<HostEvent> {
        queue.submit("marker", wait, Box::new(|| Ok(())))
    }

    fn allocate(&self, bytes: usize, placement: Placement, access: MemoryType) -> Result<HostMem> {
        if bytes == 0 {
            return Err(ComputeError::InvalidInput("zero-sized allocation".into()));
        }
        let mut ledger = self.memory.lock();
        if let Placement::Shared(strategy) = placement {
            if !strategy.is_svm() || !self.config.capabilities.supports(strategy) {
                let reason = format!("{strategy} not supported by {}", self.config.name);
                return Err(ledger.reject(bytes, reason));
            }
            if matches!(self.config.svm_fail_at, Some(limit) if bytes >= limit) {
                let reason = format!("{strategy} allocation rejected by device");
                return Err(ledger.reject(bytes, reason));
            }
        }
        let mem = ledger.allocate(bytes, placement, access)?;
        debug!(id = mem.id, bytes, ?placement, "host allocation");
        Ok(mem)
    }

    fn release(&self, mem: &HostMem) {
        if !self.memory.lock().release(mem) {
            warn!(id = mem.id, "release of unknown or already released memory handle");
        }
    }

    fn mem_size(&self, mem: &HostMem) -> usize {
        mem.bytes
    }

    fn write(
        &self,
        queue: &HostQueue,
        mem: &HostMem,
        offset: usize,
        data: &[u8],
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let alloc = self.resolve(mem)?;
        Self::check_range(&alloc, offset, data.len())?;
        let staged = data.to_vec();
        queue.submit(
            "write",
            wait,
            Box::new(move || {
                alloc.write()[offset..offset + staged.len()].copy_from_slice(&staged);
                Ok(())
            }),
        )
    }

    fn read(
        &self,
        queue: &HostQueue,
        mem: &HostMem,
        offset: usize,
        out: &mut [u8],
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let alloc = self.resolve(mem)?;
        Self::check_range(&alloc, offset, out.len())?;
        let len = out.len();
        let staging = Arc::new(Mutex::new(Vec::new()));
        let sink = staging.clone();
        let ev = queue.submit(
            "read",
            wait,
            Box::new(move || {
                *sink.lock() = alloc.read()[offset..offset + len].to_vec();
                Ok(())
            }),
        )?;
        ev.wait().map_err(ComputeError::Device)?;
        out.copy_from_slice(&staging.lock());
        Ok(ev)
    }

    fn fill_zero(
        &self,
        queue: &HostQueue,
        mem: &HostMem,
        offset: usize,
        len: usize,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let alloc = self.resolve(mem)?;
        Self::check_range(&alloc, offset, len)?;
        queue.submit(
            "fill",
            wait,
            Box::new(move || {
                alloc.write()[offset..offset + len].fill(0);
                Ok(())
            }),
        )
    }

    fn map(&self, queue: &HostQueue, mem: &HostMem) -> Result<()> {
        let alloc = self.resolve(mem)?;
        if !matches!(alloc.placement, Placement::Shared(_)) {
            let msg = format!("allocation {} is not shared memory", mem.id);
            return Err(ComputeError::InvalidInput(msg));
        }
        // Blocking map: outstanding device work on this queue completes first.
        self.finish(queue)?;
        alloc.set_mapped(true);
        Ok(())
    }

    fn unmap(&self, queue: &HostQueue, mem: &HostMem) -> Result<()> {
        let alloc = self.resolve(mem)?;
        if !matches!(alloc.placement, Placement::Shared(_)) {
            let msg = format!("allocation {} is not shared memory", mem.id);
            return Err(ComputeError::InvalidInput(msg));
        }
        alloc.set_mapped(false);
        self.flush(queue)
    }

    fn with_host_access(&self, mem: &HostMem, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let alloc = self.resolve(mem)?;
        if !matches!(alloc.placement, Placement::Shared(_)) {
            return Err(ComputeError::InvalidInput(format!(
                "allocation {} has no host-visible pointer",
                mem.id
            )));
        }
        if alloc.is_coarse_grain() && !alloc.is_mapped() {
            return Err(ComputeError::Device(format!(
                "coarse-grain shared region {} accessed while unmapped",
                mem.id
            )));
        }
        let mut data = alloc.write();
        f(&mut data[..]);
        Ok(())
    }

    fn build_program(&self, source: &str) -> Result<HostProgram> {
        let entries = parse_entries(source);
        let registry = self.registry.read();
        let mut log = Vec::new();
        let mut resolved = HashMap::new();
        for (line, name) in entries {
            if name.is_empty() {
                log.push(format!("line {line}: error: .entry without a name"));
                continue;
            }
            match registry.get(&name) {
                Some(func) => {
                    resolved.insert(name, func.clone());
                }
                None => log.push(format!("line {line}: error: unresolved entry '{name}'")),
            }
        }
        if resolved.is_empty() && log.is_empty() {
            log.push("error: no .entry declarations found".to_string());
        }
        if !log.is_empty() {
            return Err(ComputeError::Compilation { log: log.join("\n") });
        }
        let id = self.next_id();
        self.objects.lock().stats.programs_built += 1;
        debug!(program = id, entries = resolved.len(), "host program built");
        Ok(HostProgram { id, entries: resolved })
    }

    fn create_kernel(&self, program: &HostProgram, name: &str) -> Result<HostKernel> {
        let func = program
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| ComputeError::KernelNotFound { name: name.to_string() })?;
        let kernel =
            HostKernel { id: self.next_id(), program_id: program.id, name: Arc::from(name), func };
        let mut objects = self.objects.lock();
        objects.stats.kernels_created += 1;
        *objects.live_kernels.entry(program.id).or_insert(0) += 1;
        Ok(kernel)
    }

    fn release_kernel(&self, kernel: HostKernel) {
        let mut objects = self.objects.lock();
        objects.stats.kernels_released += 1;
        if let Some(n) = objects.live_kernels.get_mut(&kernel.program_id) {
            *n = n.saturating_sub(1);
        }
    }

    fn release_program(&self, program: HostProgram) {
        let mut objects = self.objects.lock();
        objects.stats.programs_released += 1;
        if objects.live_kernels.remove(&program.id).unwrap_or(0) > 0 {
            objects.stats.early_program_releases += 1;
            warn!(program = program.id, "program released while kernels are alive");
        }
    }

    fn launch(
        &self,
        queue: &HostQueue,
        kernel: &HostKernel,
        args: &[KernelArg<'_, HostMem>],
        dims: LaunchDims,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        if dims.global == 0 {
            return Err(ComputeError::InvalidInput(format!("{}: empty launch", kernel.name)));
        }
        if let Some(local) = dims.local {
            if local == 0 || local > self.config.max_work_group_size || dims.global % local != 0 {
                return Err(ComputeError::InvalidInput(format!(
                    "{}: invalid work-group size {local} for {} work-items (max {})",
                    kernel.name, dims.global, self.config.max_work_group_size
                )));
            }
        }
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            resolved.push(match arg {
                KernelArg::Mem(m) => HostArg::Mem(self.resolve(m)?),
                KernelArg::U32(v) => HostArg::U32(*v),
                KernelArg::F32(v) => HostArg::F32(*v),
            });
        }
        let fails = self.failing.read().contains(&*kernel.name);
        let launch = HostLaunch { name: kernel.name.clone(), args: resolved, dims };
        let func = kernel.func.clone();
        self.objects.lock().stats.launches += 1;
        queue.submit(
            "kernel",
            wait,
            Box::new(move || {
                if fails {
                    return Err(format!("{}: injected failure", launch.name));
                }
                func(&launch)
            }),
        )
    }

    fn lane_fft_program_source(&self) -> Cow<'static, str> {
        Cow::Borrowed(HOST_LANE_FFT_SOURCE)
    }

    fn create_transform_plan(&self, _queue: &HostQueue, desc: &TransformDesc) -> Result<HostPlan> {
        let plan = HostPlan::new(desc)?;
        self.objects.lock().stats.plans_created += 1;
        Ok(plan)
    }

    fn enqueue_transform(
        &self,
        queue: &HostQueue,
        plan: &HostPlan,
        input: &HostMem,
        output: &HostMem,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let src = self.resolve(input)?;
        let dst = self.resolve(output)?;
        plan.check_buffers(&src, &dst)?;
        let plan = plan.clone();
        queue.submit("transform", wait, Box::new(move || plan.execute(&src, &dst)))
    }

    fn release_plan(&self, _plan: HostPlan) {
        self.objects.lock().stats.plans_released += 1;
    }

    fn wait(&self, events: &[HostEvent]) -> Result<()> {
        // Wait for all of them, then report the first failure.
        let mut first = None;
        for ev in events {
            if let Err(msg) = ev.wait() {
                first.get_or_insert(msg);
            }
        }
        match first {
            Some(msg) => Err(ComputeError::Device(msg)),
            None => Ok(()),
        }
    }

    fn event_timing(&self, event: &HostEvent) -> Option<EventTiming> {
        Some(event.timing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransformLayout;
    use crate::utilities::enums::MemoryStrategy;
    use num_complex::Complex32;

    fn device() -> HostAccelerator {
        HostAccelerator::new(HostConfig::default().with_global_memory(1 << 20))
    }

    #[test]
    fn write_then_read_round_trips() {
        let dev = device();
        let q = dev.create_queue().unwrap();
        let m = dev.allocate(16, Placement::Device, MemoryType::ReadWrite).unwrap();
        let w = dev.write(&q, &m, 4, &[1, 2, 3, 4], &[]).unwrap();
        let mut out = [0u8; 8];
        dev.read(&q, &m, 0, &mut out, &[w]).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        dev.release(&m);
        assert_eq!(dev.memory_stats().live, 0);
    }

    #[test]
    fn out_of_range_copy_is_capacity_error() {
        let dev = device();
        let q = dev.create_queue().unwrap();
        let m = dev.allocate(8, Placement::Device, MemoryType::ReadWrite).unwrap();
        assert!(matches!(dev.write(&q, &m, 4, &[0; 8], &[]), Err(ComputeError::Capacity { .. })));
        let mut out = [0u8; 9];
        assert!(matches!(dev.read(&q, &m, 0, &mut out, &[]), Err(ComputeError::Capacity { .. })));
    }

    #[test]
    fn unsupported_or_failing_svm_is_allocation_error() {
        let coarse = Placement::Shared(MemoryStrategy::SvmCoarseGrain);
        let fine = Placement::Shared(MemoryStrategy::SvmFineGrain);
        let bare = HostConfig::default().with_capabilities(DeviceCapabilities::none());
        let dev = HostAccelerator::new(bare);
        let err = dev.allocate(64, fine, MemoryType::ReadWrite).unwrap_err();
        assert!(err.is_allocation());

        let dev = HostAccelerator::new(HostConfig::default().with_svm_fail_at(1024));
        assert!(dev.allocate(512, coarse, MemoryType::ReadWrite).is_ok());
        assert!(dev.allocate(4096, coarse, MemoryType::ReadWrite).unwrap_err().is_allocation());
    }

    #[test]
    fn coarse_grain_access_requires_map() {
        let dev = device();
        let q = dev.create_queue().unwrap();
        let coarse = Placement::Shared(MemoryStrategy::SvmCoarseGrain);
        let m = dev.allocate(8, coarse, MemoryType::ReadWrite).unwrap();
        assert!(dev.with_host_access(&m, &mut |_| {}).is_err());
        dev.map(&q, &m).unwrap();
        dev.with_host_access(&m, &mut |bytes| bytes[0] = 7).unwrap();
        dev.unmap(&q, &m).unwrap();
        let mut out = [0u8; 1];
        dev.read(&q, &m, 0, &mut out, &[]).unwrap();
        assert_eq!(out[0], 7);
    }

    #[test]
    fn fine_grain_access_needs_no_map() {
        let dev = device();
        let fine = Placement::Shared(MemoryStrategy::SvmFineGrain);
        let m = dev.allocate(8, fine, MemoryType::ReadWrite).unwrap();
        dev.with_host_access(&m, &mut |bytes| bytes.fill(1)).unwrap();
    }

    #[test]
    fn build_reports_unresolved_entries_with_log() {
        let dev = device();
        match dev.build_program(".visible .entry missing_kernel(\n") {
            Err(ComputeError::Compilation { log }) => assert!(log.contains("missing_kernel")),
            other => panic!("expected compilation error, got {other:?}"),
        }
        let empty = dev.build_program("// nothing here");
        assert!(matches!(empty, Err(ComputeError::Compilation { .. })));
    }

    #[test]
    fn unknown_kernel_name_is_kernel_not_found() {
        let dev = device();
        let p = dev.build_program(&dev.lane_fft_program_source()).unwrap();
        assert!(matches!(dev.create_kernel(&p, "nope"), Err(ComputeError::KernelNotFound { .. })));
        assert!(dev.create_kernel(&p, PAD_KERNEL).is_ok());
    }

    #[test]
    fn registered_kernel_runs() {
        let dev = device();
        dev.register_kernel("scale_c32", |l: &HostLaunch| {
            let buf = l.mem(0)?;
            let k = l.f32(1)?;
            let mut data = buf.write();
            let v: &mut [Complex32] =
                bytemuck::try_cast_slice_mut(&mut data[..]).map_err(|e| e.to_string())?;
            v.iter_mut().for_each(|z| *z *= k);
            Ok(())
        });
        let q = dev.create_queue().unwrap();
        let p = dev.build_program(".entry scale_c32(").unwrap();
        let k = dev.create_kernel(&p, "scale_c32").unwrap();
        let m = dev.allocate(16, Placement::Device, MemoryType::ReadWrite).unwrap();
        let src = [Complex32::new(1.0, 2.0), Complex32::new(-1.0, 0.5)];
        let w = dev.write(&q, &m, 0, bytemuck::cast_slice(&src), &[]).unwrap();
        let ev = dev
            .launch(&q, &k, &[KernelArg::Mem(&m), KernelArg::F32(2.0)], LaunchDims::linear(2), &[w])
            .unwrap();
        let mut out = [Complex32::new(0.0, 0.0); 2];
        dev.read(&q, &m, 0, bytemuck::cast_slice_mut(&mut out), &[ev]).unwrap();
        assert_eq!(out, [Complex32::new(2.0, 4.0), Complex32::new(-2.0, 1.0)]);
    }

    #[test]
    fn injected_failure_surfaces_on_wait() {
        let dev = device();
        dev.inject_kernel_failure(PAD_KERNEL);
        let q = dev.create_queue().unwrap();
        let p = dev.build_program(&dev.lane_fft_program_source()).unwrap();
        let k = dev.create_kernel(&p, PAD_KERNEL).unwrap();
        let ev = dev.launch(&q, &k, &[], LaunchDims::linear(1), &[]).unwrap();
        let after = dev.marker(&q, &[ev.clone()]).unwrap();
        assert!(matches!(dev.wait(&[ev, after]), Err(ComputeError::Device(_))));
    }

    #[test]
    fn invalid_work_group_is_rejected_at_enqueue() {
        let dev = device();
        let q = dev.create_queue().unwrap();
        let p = dev.build_program(&dev.lane_fft_program_source()).unwrap();
        let k = dev.create_kernel(&p, PEAK_KERNEL).unwrap();
        let dims = LaunchDims { global: 300, local: Some(256) };
        assert!(matches!(dev.launch(&q, &k, &[], dims, &[]), Err(ComputeError::InvalidInput(_))));
    }

    #[test]
    fn kernels_and_transforms_honor_access_flags() {
        let dev = device();
        let q = dev.create_queue().unwrap();
        let p = dev.build_program(&dev.lane_fft_program_source()).unwrap();
        let pad = dev.create_kernel(&p, PAD_KERNEL).unwrap();
        let bytes = 4 * std::mem::size_of::<Complex32>();
        let ro = dev.allocate(bytes, Placement::Device, MemoryType::ReadOnly).unwrap();
        let wo = dev.allocate(bytes, Placement::Device, MemoryType::WriteOnly).unwrap();
        let rw = dev.allocate(bytes, Placement::Device, MemoryType::ReadWrite).unwrap();
        fn pad_args<'a>(input: &'a HostMem, output: &'a HostMem) -> [KernelArg<'a, HostMem>; 6] {
            [
                KernelArg::Mem(input),
                KernelArg::Mem(output),
                KernelArg::U32(1),
                KernelArg::U32(4),
                KernelArg::U32(4),
                KernelArg::U32(0),
            ]
        }

        let dims = LaunchDims::linear(4);
        let ok = dev.launch(&q, &pad, &pad_args(&ro, &wo), dims, &[]).unwrap();
        dev.wait(&[ok]).unwrap();
        let into_ro = dev.launch(&q, &pad, &pad_args(&rw, &ro), dims, &[]).unwrap();
        match dev.wait(&[into_ro]) {
            Err(ComputeError::Device(msg)) => assert!(msg.contains("read-only"), "{msg}"),
            other => panic!("expected device error, got {other:?}"),
        }
        let from_wo = dev.launch(&q, &pad, &pad_args(&wo, &rw), dims, &[]).unwrap();
        assert!(dev.wait(&[from_wo]).is_err());

        let desc = TransformDesc {
            length: 4,
            batch: 1,
            layout: TransformLayout::OutOfPlace,
            hooks: None,
        };
        let plan = dev.create_transform_plan(&q, &desc).unwrap();
        assert!(matches!(
            dev.enqueue_transform(&q, &plan, &rw, &ro, &[]),
            Err(ComputeError::InvalidInput(_))
        ));
        let ev = dev.enqueue_transform(&q, &plan, &ro, &rw, &[]).unwrap();
        dev.wait(&[ev]).unwrap();
        dev.release_plan(plan);
        dev.release_kernel(pad);
        dev.release_program(p);
    }

    #[test]
    fn early_program_release_is_counted() {
        let dev = device();
        let p = dev.build_program(&dev.lane_fft_program_source()).unwrap();
        let k = dev.create_kernel(&p, PAD_KERNEL).unwrap();
        dev.release_program(p);
        assert_eq!(dev.object_stats().early_program_releases, 1);
        dev.release_kernel(k);
    }
}
