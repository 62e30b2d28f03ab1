//! Explicit compute context shared by every component that touches the
//! device.
//!
//! Construction order is capability query, queue pool, program cache, buffer
//! factory. Fields are declared in reverse so they drop in reverse: buffers
//! and programs go before the queues they were created against, and the
//! device handle goes last.

use crate::device::{Accelerator, DeviceCapabilities, DeviceInfo, KernelArg, LaunchDims};
use crate::error::Result;
use crate::memory::{BufferConfig, BufferFactory, BufferStatistics};
use crate::program::{CacheStatistics, CompiledProgram, KernelRef, ProgramCache};
use crate::queue_pool::{QueuePool, QueueStatistics};
use crate::utilities::helpers::env_parse;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of pooled queues; 0 means one per hardware thread.
    pub queue_count: usize,
    pub buffers: BufferConfig,
}

impl ContextConfig {
    pub fn with_queues(queue_count: usize) -> Self {
        Self { queue_count, ..Self::default() }
    }

    /// Applies `RADAR_QUEUE_COUNT` and the buffer env knobs.
    pub fn from_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("RADAR_QUEUE_COUNT") {
            self.queue_count = n;
        }
        self.buffers = self.buffers.from_env();
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ContextStatistics {
    pub queues: QueueStatistics,
    pub programs: CacheStatistics,
    pub buffers: BufferStatistics,
}

impl fmt::Display for ContextStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.queues)?;
        writeln!(f, "{}", self.programs)?;
        write!(f, "{}", self.buffers)
    }
}

pub struct ComputeContext<A: Accelerator> {
    buffers: BufferFactory<A>,
    programs: ProgramCache<A>,
    queues: QueuePool<A>,
    capabilities: DeviceCapabilities,
    info: DeviceInfo,
    device: Arc<A>,
}

impl<A: Accelerator> ComputeContext<A> {
    pub fn new(device: Arc<A>, config: ContextConfig) -> Result<Arc<Self>> {
        let info = device.info();
        let capabilities = device.capabilities();
        let queues = QueuePool::new(device.clone());
        queues.initialize(config.queue_count)?;
        let programs = ProgramCache::new(device.clone());
        let transfer_queue = queues.queue(0)?;
        let buffers =
            BufferFactory::new(device.clone(), transfer_queue, capabilities, config.buffers);
        info!(
            device = %info.name,
            queues = queues.size(),
            svm = capabilities.has_any_svm(),
            "compute context ready"
        );
        Ok(Arc::new(Self { buffers, programs, queues, capabilities, info, device }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<A> {
        &self.device
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[inline]
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    #[inline]
    pub fn queues(&self) -> &QueuePool<A> {
        &self.queues
    }

    #[inline]
    pub fn programs(&self) -> &ProgramCache<A> {
        &self.programs
    }

    #[inline]
    pub fn buffers(&self) -> &BufferFactory<A> {
        &self.buffers
    }

    pub fn load_program(&self, source: &str) -> Result<Arc<CompiledProgram<A>>> {
        self.programs.get_or_compile(source)
    }

    pub fn kernel(&self, source: &str, name: &str) -> Result<KernelRef<A>> {
        self.load_program(source)?.kernel(name)
    }

    /// Launches on the next pooled queue and returns without waiting.
    pub fn execute_kernel_async(
        &self,
        kernel: &A::Kernel,
        args: &[KernelArg<'_, A::Mem>],
        dims: LaunchDims,
        wait: &[A::Event],
    ) -> Result<A::Event> {
        let queue = self.queues.next_queue()?;
        self.device.launch(&queue, kernel, args, dims, wait)
    }

    /// Launches and blocks until the kernel finished.
    pub fn execute_kernel(
        &self,
        kernel: &A::Kernel,
        args: &[KernelArg<'_, A::Mem>],
        dims: LaunchDims,
    ) -> Result<()> {
        let ev = self.execute_kernel_async(kernel, args, dims, &[])?;
        self.device.wait(&[ev])
    }

    pub fn wait_for_events(&self, events: &[A::Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.device.wait(events)
    }

    pub fn flush(&self) -> Result<()> {
        self.queues.flush_all()
    }

    pub fn finish(&self) -> Result<()> {
        self.queues.finish_all()
    }

    pub fn svm_info(&self) -> String {
        self.capabilities.to_string()
    }

    pub fn device_summary(&self) -> String {
        format!("{}\n{}\nQueues        : {}", self.info, self.capabilities, self.queues.size())
    }

    pub fn statistics(&self) -> ContextStatistics {
        ContextStatistics {
            queues: self.queues.statistics(),
            programs: self.programs.statistics(),
            buffers: self.buffers.statistics(),
        }
    }
}

impl<A: Accelerator> fmt::Debug for ComputeContext<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.info.name)
            .field("queues", &self.queues.size())
            .finish()
    }
}
