//! Accelerator API seam.
//!
//! Everything above this module (buffers, queue pool, program cache, the
//! lane FFT orchestrator) talks to the device only through [`Accelerator`].
//! Two implementations ship with the crate:
//!
//! - [`host::HostAccelerator`]: software device with worker-thread queues,
//!   always available, used by the test-suite and on CPU-only machines.
//! - `cuda::CudaAccelerator` (feature `cuda`): cust-backed CUDA device.
//!
//! All enqueue operations are asynchronous and return an event; completion is
//! observed only through [`Accelerator::wait`].

pub mod host;

use crate::error::Result;
use crate::utilities::enums::{MemoryStrategy, MemoryType};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Shared-virtual-memory support reported by a device. Queried once when a
/// [`crate::context::ComputeContext`] is built and never mutated afterwards.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub coarse_grain: bool,
    pub fine_grain_buffer: bool,
    pub fine_grain_system: bool,
    pub atomics: bool,
    /// (major, minor) of the device API.
    pub api_version: (u32, u32),
}

impl DeviceCapabilities {
    pub const fn none() -> Self {
        Self {
            coarse_grain: false,
            fine_grain_buffer: false,
            fine_grain_system: false,
            atomics: false,
            api_version: (1, 2),
        }
    }

    pub const fn full() -> Self {
        Self {
            coarse_grain: true,
            fine_grain_buffer: true,
            fine_grain_system: true,
            atomics: true,
            api_version: (3, 0),
        }
    }

    #[inline]
    pub fn has_any_svm(&self) -> bool {
        self.coarse_grain || self.fine_grain_buffer || self.fine_grain_system
    }

    pub fn supports(&self, strategy: MemoryStrategy) -> bool {
        match strategy {
            MemoryStrategy::Auto | MemoryStrategy::RegularBuffer => true,
            MemoryStrategy::SvmCoarseGrain => self.coarse_grain,
            MemoryStrategy::SvmFineGrain => self.fine_grain_buffer,
            MemoryStrategy::SvmFineGrainSystem => self.fine_grain_system,
        }
    }

    /// Richest supported grain: system > fine > coarse > regular.
    pub fn best_svm_strategy(&self) -> MemoryStrategy {
        if self.fine_grain_system {
            MemoryStrategy::SvmFineGrainSystem
        } else if self.fine_grain_buffer {
            MemoryStrategy::SvmFineGrain
        } else if self.coarse_grain {
            MemoryStrategy::SvmCoarseGrain
        } else {
            MemoryStrategy::RegularBuffer
        }
    }

    /// Finest grain usable for buffer allocations (system SVM aside).
    pub fn finest_svm_strategy(&self) -> MemoryStrategy {
        if self.fine_grain_buffer {
            MemoryStrategy::SvmFineGrain
        } else if self.fine_grain_system {
            MemoryStrategy::SvmFineGrainSystem
        } else if self.coarse_grain {
            MemoryStrategy::SvmCoarseGrain
        } else {
            MemoryStrategy::RegularBuffer
        }
    }
}

impl fmt::Display for DeviceCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yn = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "SVM capabilities (API {}.{}):", self.api_version.0, self.api_version.1)?;
        writeln!(f, "  coarse-grain buffer : {}", yn(self.coarse_grain))?;
        writeln!(f, "  fine-grain buffer   : {}", yn(self.fine_grain_buffer))?;
        writeln!(f, "  fine-grain system   : {}", yn(self.fine_grain_system))?;
        writeln!(f, "  atomics             : {}", yn(self.atomics))?;
        write!(f, "  best strategy       : {}", self.best_svm_strategy())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub global_memory: usize,
    pub local_memory: usize,
    pub compute_units: u32,
    pub max_work_group_size: usize,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device        : {}", self.name)?;
        writeln!(f, "Vendor        : {}", self.vendor)?;
        writeln!(f, "Driver        : {}", self.driver_version)?;
        writeln!(f, "Global memory : {} MB", self.global_memory >> 20)?;
        writeln!(f, "Local memory  : {} KB", self.local_memory >> 10)?;
        writeln!(f, "Compute units : {}", self.compute_units)?;
        write!(f, "Max work-group: {}", self.max_work_group_size)
    }
}

/// Where an allocation lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Device-local memory reached through explicit copies.
    Device,
    /// Shared virtual memory of the given grain (never `Auto`/`RegularBuffer`).
    Shared(MemoryStrategy),
}

impl Placement {
    #[inline]
    pub fn for_strategy(strategy: MemoryStrategy) -> Self {
        if strategy.is_svm() {
            Placement::Shared(strategy)
        } else {
            Placement::Device
        }
    }
}

/// One kernel argument. Scalars are passed by value; memory by handle.
#[derive(Debug)]
pub enum KernelArg<'a, M> {
    Mem(&'a M),
    U32(u32),
    F32(f32),
}

impl<'a, M> Clone for KernelArg<'a, M> {
    fn clone(&self) -> Self {
        match self {
            KernelArg::Mem(m) => KernelArg::Mem(m),
            KernelArg::U32(v) => KernelArg::U32(*v),
            KernelArg::F32(v) => KernelArg::F32(*v),
        }
    }
}

/// 1-D launch geometry. `global` is the total work-item count; when `local`
/// is given, `global` must be a multiple of it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchDims {
    pub global: usize,
    pub local: Option<usize>,
}

impl LaunchDims {
    #[inline]
    pub fn linear(global: usize) -> Self {
        Self { global, local: None }
    }

    #[inline]
    pub fn grouped(groups: usize, local: usize) -> Self {
        Self { global: groups * local, local: Some(local) }
    }

    #[inline]
    pub fn groups(&self) -> usize {
        match self.local {
            Some(l) if l > 0 => self.global / l,
            _ => 1,
        }
    }
}

/// Profiling timestamps of one command, in nanoseconds since an arbitrary
/// per-device origin.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventTiming {
    pub queued_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl EventTiming {
    #[inline]
    pub fn duration_ms(&self) -> f64 {
        self.end_ns.saturating_sub(self.start_ns) as f64 / 1.0e6
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransformLayout {
    InPlace,
    OutOfPlace,
}

/// Per-element callback sources compiled into a transform plan. Backends
/// without callback support reject plans that carry hooks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformHooks {
    pub pre: Option<String>,
    pub post: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformDesc {
    pub length: usize,
    pub batch: usize,
    pub layout: TransformLayout,
    pub hooks: Option<TransformHooks>,
}

/// The external accelerator API the runtime orchestrates.
///
/// Handles (`Queue`, `Event`, `Mem`, `Kernel`) are cheap to clone; cloning a
/// handle never duplicates the underlying device object. Memory handles are
/// released explicitly through [`Accelerator::release`], exactly once.
pub trait Accelerator: Send + Sync + 'static {
    type Queue: Clone + Send + Sync + fmt::Debug;
    type Event: Clone + Send + Sync + fmt::Debug;
    type Mem: Clone + Send + Sync + fmt::Debug;
    type Program: Send + Sync;
    type Kernel: Clone + Send + Sync;
    type Plan: Send + Sync;

    fn info(&self) -> DeviceInfo;
    fn capabilities(&self) -> DeviceCapabilities;
    fn free_memory(&self) -> Option<usize> {
        None
    }

    fn create_queue(&self) -> Result<Self::Queue>;
    fn flush(&self, queue: &Self::Queue) -> Result<()>;
    fn finish(&self, queue: &Self::Queue) -> Result<()>;
    /// Event that completes once every event in `wait` has completed.
    fn marker(&self, queue: &Self::Queue, wait: &[Self::Event]) -> Result<Self::Event>;

    fn allocate(&self, bytes: usize, placement: Placement, access: MemoryType) -> Result<Self::Mem>;
    fn release(&self, mem: &Self::Mem);
    fn mem_size(&self, mem: &Self::Mem) -> usize;

    /// Enqueues a host-to-device copy. `data` is captured before returning.
    fn write(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        offset: usize,
        data: &[u8],
        wait: &[Self::Event],
    ) -> Result<Self::Event>;
    /// Blocking device-to-host copy; the returned event carries its timing.
    fn read(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        offset: usize,
        out: &mut [u8],
        wait: &[Self::Event],
    ) -> Result<Self::Event>;
    fn fill_zero(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        offset: usize,
        len: usize,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Blocking map of a shared allocation for host access.
    fn map(&self, queue: &Self::Queue, mem: &Self::Mem) -> Result<()>;
    fn unmap(&self, queue: &Self::Queue, mem: &Self::Mem) -> Result<()>;
    /// Direct host access to a shared allocation through its shared pointer.
    fn with_host_access(&self, mem: &Self::Mem, f: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    fn build_program(&self, source: &str) -> Result<Self::Program>;
    fn create_kernel(&self, program: &Self::Program, name: &str) -> Result<Self::Kernel>;
    fn release_kernel(&self, _kernel: Self::Kernel) {}
    fn release_program(&self, _program: Self::Program) {}
    fn launch(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Mem>],
        dims: LaunchDims,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;
    /// Source of the pad / peak-search kernels used by the lane FFT orchestrator.
    fn lane_fft_program_source(&self) -> Cow<'static, str>;

    fn supports_transform_hooks(&self) -> bool {
        false
    }
    fn create_transform_plan(
        &self,
        queue: &Self::Queue,
        desc: &TransformDesc,
    ) -> Result<Self::Plan>;
    fn enqueue_transform(
        &self,
        queue: &Self::Queue,
        plan: &Self::Plan,
        input: &Self::Mem,
        output: &Self::Mem,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;
    fn release_plan(&self, _plan: Self::Plan) {}

    /// Blocks until every event completed; returns the first failure.
    fn wait(&self, events: &[Self::Event]) -> Result<()>;
    fn event_timing(&self, event: &Self::Event) -> Option<EventTiming>;
}
