#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

//! Accelerator compute runtime for radar lane FFT processing.
//!
//! Device buffers with explicit-copy and shared-virtual-memory storage, a
//! queue pool, a content-hashed program cache, and a batch/parallel lane
//! FFT orchestrator, all driven through the [`device::Accelerator`] seam.
//! [`device::host::HostAccelerator`] is always available; the CUDA device
//! lives behind the `cuda` feature.

pub mod context;
pub mod device;
pub mod error;
pub mod fft;
pub mod memory;
pub mod program;
pub mod queue_pool;
pub mod utilities;

pub mod cuda;

pub use context::{ComputeContext, ContextConfig, ContextStatistics};
pub use device::host::{HostAccelerator, HostConfig};
pub use device::{Accelerator, DeviceCapabilities, DeviceInfo, KernelArg, LaunchDims};
pub use error::{ComputeError, Result};
pub use fft::{
    BatchConfig, FftJobResult, JobParams, LaneFftProcessor, LaneResult, PeakResult, ProfilingReport,
};
pub use memory::{BufferConfig, BufferFactory, MemoryBuffer, UsageHint};
pub use program::{CompiledProgram, ProgramCache};
pub use queue_pool::QueuePool;
pub use utilities::enums::{ExecutionMode, MemoryStrategy, MemoryType};
