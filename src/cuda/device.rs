#![cfg(feature = "cuda")]

//! cust-backed accelerator.
//!
//! - PTX load via include_str!(concat!(env!("OUT_DIR"), "/lane_fft_kernel.ptx")) with JIT
//!   options DetermineTargetFromContext + OptLevel O2, then simpler fallbacks.
//! - One NON_BLOCKING stream per queue; events are driver events recorded on it.
//! - Explicit-copy placements use `cuMemAlloc`, shared placements use managed memory.
//! - The lane transform is a batched radix-2 (bit reverse + log2(n) butterfly stages).

use crate::device::{
    Accelerator, DeviceCapabilities, DeviceInfo, EventTiming, KernelArg, LaunchDims, Placement,
    TransformDesc, TransformLayout,
};
use crate::error::{ComputeError, Result};
use crate::utilities::enums::{MemoryStrategy, MemoryType};
use cust::context::{Context, CurrentContext};
use cust::device::{Device, DeviceAttribute};
use cust::function::{BlockSize, GridSize};
use cust::memory::mem_get_info;
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use cust::sys as cu;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const LANE_FFT_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/lane_fft_kernel.ptx"));
const DEFAULT_BLOCK: usize = 256;
const CU_MEM_ATTACH_GLOBAL: u32 = 0x1;

fn check(res: cu::CUresult, what: &str) -> Result<()> {
    if res == cu::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(ComputeError::Device(format!("{what}: {res:?}")))
    }
}

fn load_module(ptx: &str) -> std::result::Result<Module, cust::error::CudaError> {
    let jit_opts = &[
        ModuleJitOption::DetermineTargetFromContext,
        ModuleJitOption::OptLevel(OptLevel::O2),
    ];
    Module::from_ptx(ptx, jit_opts)
        .or_else(|_| Module::from_ptx(ptx, &[ModuleJitOption::DetermineTargetFromContext]))
        .or_else(|_| Module::from_ptx(ptx, &[]))
}

/// Driver object shared across threads. Every entry point makes the owning
/// context current before touching it.
struct Bound<T>(T);

// SAFETY: driver handles are thread-agnostic once the context is current;
// the accelerator binds its context at the top of every call.
unsafe impl<T> Send for Bound<T> {}
unsafe impl<T> Sync for Bound<T> {}

struct RawEvent(cu::CUevent);

// SAFETY: CUevent handles may be recorded and queried from any thread.
unsafe impl Send for RawEvent {}
unsafe impl Sync for RawEvent {}

impl RawEvent {
    fn record(stream: &Stream) -> Result<Self> {
        let mut ev: cu::CUevent = ptr::null_mut();
        check(unsafe { cu::cuEventCreate(&mut ev, 0) }, "cuEventCreate")?;
        let ev = RawEvent(ev);
        check(unsafe { cu::cuEventRecord(ev.0, stream.as_inner()) }, "cuEventRecord")?;
        Ok(ev)
    }
}

impl Drop for RawEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = cu::cuEventDestroy_v2(self.0);
        }
    }
}

/// Completion of one command. `start` is recorded just before the command
/// and gives [`Accelerator::event_timing`] its duration.
#[derive(Clone)]
pub struct CudaEvent {
    start: Option<Arc<RawEvent>>,
    end: Arc<RawEvent>,
}

impl fmt::Debug for CudaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaEvent")
            .field("timed", &self.start.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct CudaQueue {
    id: u64,
    stream: Arc<Bound<Stream>>,
}

impl CudaQueue {
    fn stream(&self) -> &Stream {
        &self.stream.0
    }

    fn raw(&self) -> cu::CUstream {
        self.stream.0.as_inner()
    }
}

impl fmt::Debug for CudaQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaQueue({})", self.id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CudaMem {
    pub id: u64,
    ptr: cu::CUdeviceptr,
    pub bytes: usize,
    pub placement: Placement,
}

impl CudaMem {
    #[inline]
    fn at(&self, offset: usize) -> cu::CUdeviceptr {
        self.ptr + offset as cu::CUdeviceptr
    }
}

struct Allocation {
    mem: CudaMem,
    mapped: bool,
}

pub struct CudaProgram {
    id: u64,
    module: Arc<Bound<Module>>,
}

#[derive(Clone)]
pub struct CudaKernel {
    program_id: u64,
    name: Arc<str>,
    module: Arc<Bound<Module>>,
}

impl CudaKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CudaPlan {
    length: usize,
    batch: usize,
    log2: u32,
    layout: TransformLayout,
}

impl CudaPlan {
    fn new(desc: &TransformDesc) -> Result<Self> {
        if desc.hooks.is_some() {
            return Err(ComputeError::Unsupported("transform callbacks on the CUDA backend".into()));
        }
        if desc.length < 2 || !desc.length.is_power_of_two() {
            return Err(ComputeError::Unsupported(format!(
                "transform length {} is not a power of two",
                desc.length
            )));
        }
        if desc.batch == 0 {
            return Err(ComputeError::InvalidInput("transform batch is zero".into()));
        }
        if desc.length * desc.batch > u32::MAX as usize {
            return Err(ComputeError::InvalidInput("transform exceeds 32-bit indexing".into()));
        }
        Ok(Self {
            length: desc.length,
            batch: desc.batch,
            log2: desc.length.trailing_zeros(),
            layout: desc.layout,
        })
    }

    #[inline]
    fn total(&self) -> usize {
        self.length * self.batch
    }

    #[inline]
    fn bytes(&self) -> usize {
        self.total() * 8
    }
}

enum RawArg {
    Ptr(cu::CUdeviceptr),
    U32(u32),
    F32(f32),
}

impl RawArg {
    fn as_param(&mut self) -> *mut c_void {
        match self {
            RawArg::Ptr(p) => p as *mut cu::CUdeviceptr as *mut c_void,
            RawArg::U32(v) => v as *mut u32 as *mut c_void,
            RawArg::F32(v) => v as *mut f32 as *mut c_void,
        }
    }
}

pub struct CudaAccelerator {
    ordinal: u32,
    fft: Bound<Module>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    info: DeviceInfo,
    caps: DeviceCapabilities,
    ctx: Bound<Context>,
}

impl fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaAccelerator")
            .field("ordinal", &self.ordinal)
            .field("name", &self.info.name)
            .finish()
    }
}

fn not_live(id: u64) -> ComputeError {
    ComputeError::InvalidInput(format!("memory handle {id} is not live"))
}

fn not_shared(id: u64) -> ComputeError {
    ComputeError::InvalidInput(format!("allocation {id} is not shared memory"))
}

fn attr_flag(device: cu::CUdevice, attr: cu::CUdevice_attribute) -> bool {
    raw_attribute(device, attr) != 0
}

fn raw_attribute(device: cu::CUdevice, attr: cu::CUdevice_attribute) -> i32 {
    let mut v = 0i32;
    let res = unsafe { cu::cuDeviceGetAttribute(&mut v, attr, device) };
    if res == cu::CUresult::CUDA_SUCCESS {
        v
    } else {
        0
    }
}

impl CudaAccelerator {
    pub fn new(device_id: usize) -> Result<Self> {
        cust::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let ctx = Context::new(device)?;
        let fft = load_module(LANE_FFT_PTX)?;

        let mut raw_dev: cu::CUdevice = 0;
        check(unsafe { cu::cuDeviceGet(&mut raw_dev, device_id as i32) }, "cuDeviceGet")?;
        use cu::CUdevice_attribute as Attr;
        let managed = attr_flag(raw_dev, Attr::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY);
        let concurrent = attr_flag(raw_dev, Attr::CU_DEVICE_ATTRIBUTE_CONCURRENT_MANAGED_ACCESS);
        let pageable = attr_flag(raw_dev, Attr::CU_DEVICE_ATTRIBUTE_PAGEABLE_MEMORY_ACCESS);
        let atomics = attr_flag(raw_dev, Attr::CU_DEVICE_ATTRIBUTE_HOST_NATIVE_ATOMIC_SUPPORTED);

        let mut driver = 0i32;
        let _ = unsafe { cu::cuDriverGetVersion(&mut driver) };
        let api_version = ((driver / 1000) as u32, ((driver % 1000) / 10) as u32);

        let caps = DeviceCapabilities {
            coarse_grain: managed,
            fine_grain_buffer: managed && concurrent,
            fine_grain_system: managed && concurrent && pageable,
            atomics: managed && atomics,
            api_version,
        };
        let info = DeviceInfo {
            name: device.name()?,
            vendor: "NVIDIA".to_string(),
            driver_version: format!("{}.{}", api_version.0, api_version.1),
            global_memory: device.total_memory()?,
            local_memory: device.get_attribute(DeviceAttribute::MaxSharedMemoryPerBlock)?
                as usize,
            compute_units: device.get_attribute(DeviceAttribute::MultiprocessorCount)? as u32,
            max_work_group_size: device.get_attribute(DeviceAttribute::MaxThreadsPerBlock)?
                as usize,
        };
        debug!(device = %info.name, ?caps, "CUDA accelerator ready");

        Ok(Self {
            ordinal: device_id as u32,
            fft: Bound(fft),
            allocations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            info,
            caps,
            ctx: Bound(ctx),
        })
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn bind(&self) -> Result<()> {
        CurrentContext::set_current(&self.ctx.0)?;
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn resolve(&self, mem: &CudaMem) -> Result<CudaMem> {
        self.allocations
            .lock()
            .get(&mem.id)
            .map(|a| a.mem)
            .ok_or_else(|| not_live(mem.id))
    }

    fn check_range(mem: &CudaMem, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= mem.bytes => Ok(()),
            _ => Err(ComputeError::Capacity {
                requested: offset.saturating_add(len),
                capacity: mem.bytes,
            }),
        }
    }

    fn wait_on(queue: &CudaQueue, wait: &[CudaEvent]) -> Result<()> {
        for ev in wait {
            check(unsafe { cu::cuStreamWaitEvent(queue.raw(), ev.end.0, 0) }, "cuStreamWaitEvent")?;
        }
        Ok(())
    }

    fn finish_event(queue: &CudaQueue, start: Option<RawEvent>) -> Result<CudaEvent> {
        let end = RawEvent::record(queue.stream())?;
        Ok(CudaEvent { start: start.map(Arc::new), end: Arc::new(end) })
    }

    fn launch_raw(
        &self,
        queue: &CudaQueue,
        module: &Module,
        name: &str,
        args: &mut [RawArg],
        dims: LaunchDims,
    ) -> Result<()> {
        if dims.global == 0 {
            return Err(ComputeError::InvalidInput(format!("{name}: empty launch")));
        }
        let block = match dims.local {
            Some(l) if l == 0 || l > self.info.max_work_group_size || dims.global % l != 0 => {
                return Err(ComputeError::InvalidInput(format!(
                    "{name}: work-group {l} does not divide {} or exceeds {}",
                    dims.global, self.info.max_work_group_size
                )));
            }
            Some(l) => l,
            None => DEFAULT_BLOCK.min(dims.global),
        };
        let grid = dims.global.div_ceil(block);
        let func = module
            .get_function(name)
            .map_err(|_| ComputeError::KernelNotFound { name: name.to_string() })?;
        let grid: GridSize = (grid as u32, 1, 1).into();
        let block: BlockSize = (block as u32, 1, 1).into();
        let mut params: Vec<*mut c_void> = args.iter_mut().map(RawArg::as_param).collect();
        unsafe {
            queue.stream().launch(&func, grid, block, 0, &mut params[..])?;
        }
        Ok(())
    }

    fn release_all(&self) {
        let mut allocs = self.allocations.lock();
        for (_, a) in allocs.drain() {
            unsafe {
                let _ = cu::cuMemFree_v2(a.mem.ptr);
            }
        }
    }
}

impl Drop for CudaAccelerator {
    fn drop(&mut self) {
        if self.bind().is_ok() {
            let n = self.allocations.lock().len();
            if n > 0 {
                warn!(live = n, "CUDA accelerator dropped with live allocations");
            }
            self.release_all();
        }
    }
}

impl Accelerator for CudaAccelerator {
    type Queue = CudaQueue;
    type Event = CudaEvent;
    type Mem = CudaMem;
    type Program = CudaProgram;
    type Kernel = CudaKernel;
    type Plan = CudaPlan;

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn free_memory(&self) -> Option<usize> {
        self.bind().ok()?;
        mem_get_info().ok().map(|(free, _)| free)
    }

    fn create_queue(&self) -> Result<CudaQueue> {
        self.bind()?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        Ok(CudaQueue { id: self.next_id(), stream: Arc::new(Bound(stream)) })
    }

    fn flush(&self, _queue: &CudaQueue) -> Result<()> {
        // Launches are submitted to the driver immediately.
        Ok(())
    }

    fn finish(&self, queue: &CudaQueue) -> Result<()> {
        self.bind()?;
        queue.stream().synchronize()?;
        Ok(())
    }

    fn marker(&self, queue: &CudaQueue, wait: &[CudaEvent]) -> Result<CudaEvent> {
        self.bind()?;
        Self::wait_on(queue, wait)?;
        Self::finish_event(queue, None)
    }

    fn allocate(&self, bytes: usize, placement: Placement, access: MemoryType) -> Result<CudaMem> {
        if bytes == 0 {
            return Err(ComputeError::InvalidInput("zero-sized allocation".into()));
        }
        self.bind()?;
        let mut ptr: cu::CUdeviceptr = 0;
        let res = match placement {
            Placement::Device => unsafe { cu::cuMemAlloc_v2(&mut ptr, bytes) },
            Placement::Shared(strategy) => {
                if !strategy.is_svm() || !self.caps.supports(strategy) {
                    return Err(ComputeError::Allocation {
                        requested: bytes,
                        reason: format!("{strategy} not supported by {}", self.info.name),
                    });
                }
                unsafe { cu::cuMemAllocManaged(&mut ptr, bytes, CU_MEM_ATTACH_GLOBAL) }
            }
        };
        if res != cu::CUresult::CUDA_SUCCESS {
            return Err(ComputeError::Allocation { requested: bytes, reason: format!("{res:?}") });
        }
        let mem = CudaMem { id: self.next_id(), ptr, bytes, placement };
        self.allocations.lock().insert(mem.id, Allocation { mem, mapped: false });
        debug!(id = mem.id, bytes, ?placement, ?access, "CUDA allocation");
        Ok(mem)
    }

    fn release(&self, mem: &CudaMem) {
        let Some(alloc) = self.allocations.lock().remove(&mem.id) else {
            warn!(id = mem.id, "release of unknown or already released memory handle");
            return;
        };
        if self.bind().is_err() {
            return;
        }
        let res = unsafe { cu::cuMemFree_v2(alloc.mem.ptr) };
        if res != cu::CUresult::CUDA_SUCCESS {
            warn!(id = mem.id, ?res, "cuMemFree failed");
        }
    }

    fn mem_size(&self, mem: &CudaMem) -> usize {
        mem.bytes
    }

    fn write(
        &self,
        queue: &CudaQueue,
        mem: &CudaMem,
        offset: usize,
        data: &[u8],
        wait: &[CudaEvent],
    ) -> Result<CudaEvent> {
        let mem = self.resolve(mem)?;
        Self::check_range(&mem, offset, data.len())?;
        self.bind()?;
        Self::wait_on(queue, wait)?;
        let start = RawEvent::record(queue.stream())?;
        // Pageable source: ordered after the stream's pending work, copied
        // before returning so the caller's slice is free immediately.
        queue.stream().synchronize()?;
        check(
            unsafe {
                cu::cuMemcpyHtoD_v2(mem.at(offset), data.as_ptr() as *const c_void, data.len())
            },
            "cuMemcpyHtoD",
        )?;
        Self::finish_event(queue, Some(start))
    }

    fn read(
        &self,
        queue: &CudaQueue,
        mem: &CudaMem,
        offset: usize,
        out: &mut [u8],
        wait: &[CudaEvent],
    ) -> Result<CudaEvent> {
        let mem = self.resolve(mem)?;
        Self::check_range(&mem, offset, out.len())?;
        self.bind()?;
        Self::wait_on(queue, wait)?;
        let start = RawEvent::record(queue.stream())?;
        queue.stream().synchronize()?;
        check(
            unsafe {
                cu::cuMemcpyDtoH_v2(out.as_mut_ptr() as *mut c_void, mem.at(offset), out.len())
            },
            "cuMemcpyDtoH",
        )?;
        Self::finish_event(queue, Some(start))
    }

    fn fill_zero(
        &self,
        queue: &CudaQueue,
        mem: &CudaMem,
        offset: usize,
        len: usize,
        wait: &[CudaEvent],
    ) -> Result<CudaEvent> {
        let mem = self.resolve(mem)?;
        Self::check_range(&mem, offset, len)?;
        self.bind()?;
        Self::wait_on(queue, wait)?;
        let start = RawEvent::record(queue.stream())?;
        check(
            unsafe { cu::cuMemsetD8Async(mem.at(offset), 0, len, queue.raw()) },
            "cuMemsetD8Async",
        )?;
        Self::finish_event(queue, Some(start))
    }

    fn map(&self, queue: &CudaQueue, mem: &CudaMem) -> Result<()> {
        let mem = self.resolve(mem)?;
        if !matches!(mem.placement, Placement::Shared(_)) {
            return Err(not_shared(mem.id));
        }
        // Managed memory is host-visible once the device stops touching it.
        self.finish(queue)?;
        if let Some(a) = self.allocations.lock().get_mut(&mem.id) {
            a.mapped = true;
        }
        Ok(())
    }

    fn unmap(&self, queue: &CudaQueue, mem: &CudaMem) -> Result<()> {
        let mem = self.resolve(mem)?;
        if !matches!(mem.placement, Placement::Shared(_)) {
            return Err(not_shared(mem.id));
        }
        if let Some(a) = self.allocations.lock().get_mut(&mem.id) {
            a.mapped = false;
        }
        self.flush(queue)
    }

    fn with_host_access(&self, mem: &CudaMem, f: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let (mem, mapped) = {
            let allocs = self.allocations.lock();
            let a = allocs
                .get(&mem.id)
                .ok_or_else(|| not_live(mem.id))?;
            (a.mem, a.mapped)
        };
        let strategy = match mem.placement {
            Placement::Shared(s) => s,
            Placement::Device => {
                return Err(ComputeError::InvalidInput(format!(
                    "allocation {} has no host-visible pointer",
                    mem.id
                )))
            }
        };
        if strategy == MemoryStrategy::SvmCoarseGrain && !mapped {
            return Err(ComputeError::Device(format!(
                "coarse-grain shared region {} accessed while unmapped",
                mem.id
            )));
        }
        self.bind()?;
        if !self.caps.fine_grain_buffer {
            // Without concurrent managed access the host may only touch
            // managed pages while the device is idle.
            CurrentContext::synchronize()?;
        }
        // SAFETY: managed allocation of `mem.bytes` bytes, live while in the ledger.
        let data =
            unsafe { std::slice::from_raw_parts_mut(mem.ptr as usize as *mut u8, mem.bytes) };
        f(data);
        Ok(())
    }

    fn build_program(&self, source: &str) -> Result<CudaProgram> {
        self.bind()?;
        let module =
            load_module(source).map_err(|e| ComputeError::Compilation { log: e.to_string() })?;
        let id = self.next_id();
        debug!(program = id, "CUDA module loaded");
        Ok(CudaProgram { id, module: Arc::new(Bound(module)) })
    }

    fn create_kernel(&self, program: &CudaProgram, name: &str) -> Result<CudaKernel> {
        self.bind()?;
        program
            .module
            .0
            .get_function(name)
            .map_err(|_| ComputeError::KernelNotFound { name: name.to_string() })?;
        Ok(CudaKernel {
            program_id: program.id,
            name: Arc::from(name),
            module: program.module.clone(),
        })
    }

    fn release_kernel(&self, kernel: CudaKernel) {
        if self.bind().is_ok() {
            drop(kernel);
        }
    }

    fn release_program(&self, program: CudaProgram) {
        if Arc::strong_count(&program.module) > 1 {
            warn!(program = program.id, "program released while kernels are alive");
        }
        if self.bind().is_ok() {
            drop(program);
        }
    }

    fn launch(
        &self,
        queue: &CudaQueue,
        kernel: &CudaKernel,
        args: &[KernelArg<'_, CudaMem>],
        dims: LaunchDims,
        wait: &[CudaEvent],
    ) -> Result<CudaEvent> {
        let mut raw = Vec::with_capacity(args.len());
        for arg in args {
            raw.push(match arg {
                KernelArg::Mem(m) => RawArg::Ptr(self.resolve(m)?.ptr),
                KernelArg::U32(v) => RawArg::U32(*v),
                KernelArg::F32(v) => RawArg::F32(*v),
            });
        }
        self.bind()?;
        Self::wait_on(queue, wait)?;
        let start = RawEvent::record(queue.stream())?;
        if let Err(e) = self.launch_raw(queue, &kernel.module.0, &kernel.name, &mut raw, dims) {
            debug!(
                program = kernel.program_id,
                kernel = %kernel.name,
                error = %e,
                "launch rejected"
            );
            return Err(e);
        }
        Self::finish_event(queue, Some(start))
    }

    fn lane_fft_program_source(&self) -> Cow<'static, str> {
        Cow::Borrowed(LANE_FFT_PTX)
    }

    fn create_transform_plan(&self, _queue: &CudaQueue, desc: &TransformDesc) -> Result<CudaPlan> {
        CudaPlan::new(desc)
    }

    fn enqueue_transform(
        &self,
        queue: &CudaQueue,
        plan: &CudaPlan,
        input: &CudaMem,
        output: &CudaMem,
        wait: &[CudaEvent],
    ) -> Result<CudaEvent> {
        let input = self.resolve(input)?;
        let output = self.resolve(output)?;
        Self::check_range(&input, 0, plan.bytes())?;
        Self::check_range(&output, 0, plan.bytes())?;
        match plan.layout {
            TransformLayout::InPlace if input.id != output.id => {
                return Err(ComputeError::InvalidInput(
                    "in-place plan executed with distinct input and output".into(),
                ))
            }
            TransformLayout::OutOfPlace if input.id == output.id => {
                return Err(ComputeError::InvalidInput(
                    "out-of-place plan executed with aliased input and output".into(),
                ))
            }
            _ => {}
        }

        self.bind()?;
        Self::wait_on(queue, wait)?;
        let start = RawEvent::record(queue.stream())?;
        let n = plan.length as u32;
        let total = plan.total() as u32;
        let fft = &self.fft.0;
        match plan.layout {
            TransformLayout::OutOfPlace => self.launch_raw(
                queue,
                fft,
                "bit_reverse_c32",
                &mut [
                    RawArg::Ptr(input.ptr),
                    RawArg::Ptr(output.ptr),
                    RawArg::U32(n),
                    RawArg::U32(plan.log2),
                    RawArg::U32(total),
                ],
                LaunchDims::linear(plan.total()),
            )?,
            TransformLayout::InPlace => self.launch_raw(
                queue,
                fft,
                "bit_reverse_inplace_c32",
                &mut [
                    RawArg::Ptr(output.ptr),
                    RawArg::U32(n),
                    RawArg::U32(plan.log2),
                    RawArg::U32(total),
                ],
                LaunchDims::linear(plan.total()),
            )?,
        }
        let pairs = plan.total() / 2;
        let mut half = 1u32;
        while half < n {
            self.launch_raw(
                queue,
                fft,
                "radix2_stage_c32",
                &mut [
                    RawArg::Ptr(output.ptr),
                    RawArg::U32(n),
                    RawArg::U32(half),
                    RawArg::U32(pairs as u32),
                ],
                LaunchDims::linear(pairs),
            )?;
            half <<= 1;
        }
        Self::finish_event(queue, Some(start))
    }

    fn wait(&self, events: &[CudaEvent]) -> Result<()> {
        self.bind()?;
        let mut first = None;
        for ev in events {
            let res = unsafe { cu::cuEventSynchronize(ev.end.0) };
            if res != cu::CUresult::CUDA_SUCCESS && first.is_none() {
                first = Some(ComputeError::Device(format!("command failed: {res:?}")));
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn event_timing(&self, event: &CudaEvent) -> Option<EventTiming> {
        let start = event.start.as_ref()?;
        self.bind().ok()?;
        let mut ms = 0f32;
        let res = unsafe { cu::cuEventElapsedTime(&mut ms, start.0, event.end.0) };
        if res != cu::CUresult::CUDA_SUCCESS {
            return None;
        }
        Some(EventTiming { queued_ns: 0, start_ns: 0, end_ns: (ms.max(0.0) as f64 * 1.0e6) as u64 })
    }
}
