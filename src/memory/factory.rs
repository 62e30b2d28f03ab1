use super::buffer::{MemoryBuffer, RegularBuffer, SvmBuffer};
use crate::device::{Accelerator, DeviceCapabilities};
use crate::error::Result;
use crate::utilities::enums::{MemoryStrategy, MemoryType};
use crate::utilities::helpers::bytes_for;
use bytemuck::Pod;
use num_complex::Complex32;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Advisory flags for strategy selection. Never stored on the buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageHint {
    pub gpu_only: bool,
    pub frequent_host_read: bool,
    pub frequent_host_write: bool,
    pub requires_atomics: bool,
}

impl UsageHint {
    pub fn gpu_only() -> Self {
        Self { gpu_only: true, ..Self::default() }
    }

    pub fn frequent_transfer() -> Self {
        Self { frequent_host_read: true, frequent_host_write: true, ..Self::default() }
    }

    pub fn requires_atomics() -> Self {
        Self { requires_atomics: true, ..Self::default() }
    }

    #[inline]
    pub fn frequent_host_transfer(&self) -> bool {
        self.frequent_host_read || self.frequent_host_write
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffers below this many bytes always use explicit copies.
    pub small_threshold: usize,
    /// Buffers at or above this many bytes prefer the richest shared grain.
    pub large_threshold: usize,
    pub force_svm: bool,
    pub force_regular: bool,
    pub prefer_coarse_grain: bool,
    pub verbose: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            small_threshold: 1 << 20,
            large_threshold: 64 << 20,
            force_svm: false,
            force_regular: false,
            prefer_coarse_grain: false,
            verbose: false,
        }
    }
}

impl BufferConfig {
    pub fn performance() -> Self {
        Self { small_threshold: 256 << 10, large_threshold: 16 << 20, ..Self::default() }
    }

    pub fn compatibility() -> Self {
        Self { small_threshold: 256 << 20, ..Self::default() }
    }

    pub fn svm_only() -> Self {
        Self { force_svm: true, ..Self::default() }
    }

    pub fn regular_only() -> Self {
        Self { force_regular: true, ..Self::default() }
    }

    /// Applies `RADAR_BUFFER_STRATEGY=regular|svm` and `RADAR_BUFFER_VERBOSE`.
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("RADAR_BUFFER_STRATEGY") {
            match v.trim().to_ascii_lowercase().as_str() {
                "regular" => {
                    self.force_regular = true;
                    self.force_svm = false;
                }
                "svm" => {
                    self.force_svm = true;
                    self.force_regular = false;
                }
                "auto" | "" => {}
                other => warn!(value = other, "ignoring unknown RADAR_BUFFER_STRATEGY"),
            }
        }
        if crate::utilities::helpers::env_flag("RADAR_BUFFER_VERBOSE") {
            self.verbose = true;
        }
        self
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BufferStatistics {
    pub total_buffers: u64,
    pub svm_buffers: u64,
    pub regular_buffers: u64,
    pub fallbacks: u64,
    pub total_bytes: u64,
    pub svm_bytes: u64,
}

impl fmt::Display for BufferStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Buffers created : {}", self.total_buffers)?;
        writeln!(f, "  shared memory : {} ({} bytes)", self.svm_buffers, self.svm_bytes)?;
        writeln!(f, "  explicit copy : {}", self.regular_buffers)?;
        writeln!(f, "  fallbacks     : {}", self.fallbacks)?;
        write!(f, "Total bytes     : {}", self.total_bytes)
    }
}

/// Picks a storage strategy per allocation and creates the buffer.
pub struct BufferFactory<A: Accelerator> {
    device: Arc<A>,
    queue: A::Queue,
    caps: DeviceCapabilities,
    config: RwLock<BufferConfig>,
    stats: Mutex<BufferStatistics>,
}

impl<A: Accelerator> BufferFactory<A> {
    pub fn new(
        device: Arc<A>,
        queue: A::Queue,
        caps: DeviceCapabilities,
        config: BufferConfig,
    ) -> Self {
        Self {
            device,
            queue,
            caps,
            config: RwLock::new(config),
            stats: Mutex::new(BufferStatistics::default()),
        }
    }

    pub fn config(&self) -> BufferConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: BufferConfig) {
        *self.config.write() = config;
    }

    #[inline]
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    pub fn determine_strategy(&self, bytes: usize, hint: UsageHint) -> MemoryStrategy {
        let cfg = self.config.read();
        let caps = &self.caps;
        if cfg.force_regular {
            return MemoryStrategy::RegularBuffer;
        }
        if cfg.force_svm && caps.has_any_svm() {
            return caps.best_svm_strategy();
        }
        if hint.gpu_only || bytes < cfg.small_threshold || !caps.has_any_svm() {
            return MemoryStrategy::RegularBuffer;
        }
        if hint.frequent_host_transfer() {
            return caps.finest_svm_strategy();
        }
        if hint.requires_atomics && caps.atomics && caps.fine_grain_buffer {
            return MemoryStrategy::SvmFineGrain;
        }
        if bytes >= cfg.large_threshold {
            return caps.best_svm_strategy();
        }
        if cfg.prefer_coarse_grain && caps.coarse_grain {
            return MemoryStrategy::SvmCoarseGrain;
        }
        MemoryStrategy::RegularBuffer
    }

    /// Complex-float buffer of `elements` items.
    pub fn create(
        &self,
        elements: usize,
        memory_type: MemoryType,
        hint: UsageHint,
    ) -> Result<MemoryBuffer<A>> {
        self.create_typed::<Complex32>(elements, memory_type, hint)
    }

    pub fn create_typed<T: Pod>(
        &self,
        elements: usize,
        memory_type: MemoryType,
        hint: UsageHint,
    ) -> Result<MemoryBuffer<A>> {
        let bytes = bytes_for::<T>(elements)?;
        let strategy = self.determine_strategy(bytes, hint);
        self.allocate(elements, std::mem::size_of::<T>(), memory_type, strategy)
    }

    /// Complex-float buffer with an explicit strategy; `Auto` selects with
    /// the default hint. Unsupported or failing shared-memory strategies fall
    /// back to explicit copies.
    pub fn create_with_strategy(
        &self,
        elements: usize,
        memory_type: MemoryType,
        strategy: MemoryStrategy,
    ) -> Result<MemoryBuffer<A>> {
        let elem = std::mem::size_of::<Complex32>();
        let strategy = match strategy {
            MemoryStrategy::Auto => {
                self.determine_strategy(bytes_for::<Complex32>(elements)?, UsageHint::default())
            }
            s => s,
        };
        self.allocate(elements, elem, memory_type, strategy)
    }

    /// Creates a buffer sized for `data` and uploads it.
    pub fn create_with_data<T: Pod>(
        &self,
        data: &[T],
        memory_type: MemoryType,
        hint: UsageHint,
    ) -> Result<MemoryBuffer<A>> {
        let buffer = self.create_typed::<T>(data.len(), memory_type, hint)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Wraps an allocation the caller keeps ownership of.
    pub fn wrap_external(
        &self,
        mem: A::Mem,
        elements: usize,
        memory_type: MemoryType,
        strategy: MemoryStrategy,
    ) -> MemoryBuffer<A> {
        if strategy.is_svm() {
            MemoryBuffer::Svm(SvmBuffer::borrowed(
                self.device.clone(),
                self.queue.clone(),
                mem,
                elements,
                memory_type,
                strategy,
            ))
        } else {
            MemoryBuffer::Regular(RegularBuffer::borrowed(
                self.device.clone(),
                self.queue.clone(),
                mem,
                elements,
                memory_type,
            ))
        }
    }

    pub fn statistics(&self) -> BufferStatistics {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = BufferStatistics::default();
    }

    fn allocate(
        &self,
        elements: usize,
        elem_size: usize,
        memory_type: MemoryType,
        strategy: MemoryStrategy,
    ) -> Result<MemoryBuffer<A>> {
        let verbose = self.config.read().verbose;
        if strategy.is_svm() {
            if self.caps.supports(strategy) {
                let created = SvmBuffer::new(
                    self.device.clone(),
                    self.queue.clone(),
                    elements,
                    elem_size,
                    memory_type,
                    strategy,
                );
                match created {
                    Ok(buf) => {
                        let buffer = MemoryBuffer::Svm(buf);
                        self.record(&buffer, false);
                        if verbose {
                            info!(elements, %strategy, "created shared-memory buffer");
                        }
                        return Ok(buffer);
                    }
                    Err(e) if e.is_allocation() => {
                        warn!(
                            elements,
                            %strategy,
                            error = %e,
                            "shared-memory allocation failed, retrying with explicit copies"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                warn!(
                    %strategy,
                    "shared-memory strategy not supported by device, using explicit copies"
                );
            }
            let buffer = MemoryBuffer::Regular(RegularBuffer::new(
                self.device.clone(),
                self.queue.clone(),
                elements,
                elem_size,
                memory_type,
            )?);
            self.record(&buffer, true);
            return Ok(buffer);
        }

        let buffer = MemoryBuffer::Regular(RegularBuffer::new(
            self.device.clone(),
            self.queue.clone(),
            elements,
            elem_size,
            memory_type,
        )?);
        self.record(&buffer, false);
        if verbose {
            debug!(elements, "created explicit-copy buffer");
        }
        Ok(buffer)
    }

    fn record(&self, buffer: &MemoryBuffer<A>, fallback: bool) {
        let bytes = buffer.size_bytes() as u64;
        let mut s = self.stats.lock();
        s.total_buffers += 1;
        s.total_bytes += bytes;
        if buffer.is_svm() {
            s.svm_buffers += 1;
            s.svm_bytes += bytes;
        } else {
            s.regular_buffers += 1;
        }
        if fallback {
            s.fallbacks += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostAccelerator, HostConfig};
    use crate::device::Placement;
    use paste::paste;

    fn factory_with(
        host: HostConfig,
        config: BufferConfig,
    ) -> (Arc<HostAccelerator>, BufferFactory<HostAccelerator>) {
        let dev = Arc::new(HostAccelerator::new(host));
        let q = dev.create_queue().unwrap();
        let caps = dev.capabilities();
        (dev.clone(), BufferFactory::new(dev, q, caps, config))
    }

    fn factory(config: BufferConfig) -> BufferFactory<HostAccelerator> {
        factory_with(HostConfig::default(), config).1
    }

    const MB: usize = 1 << 20;

    #[test]
    fn small_buffers_are_regular_for_every_capability_set() {
        let caps_sets = [
            DeviceCapabilities::none(),
            DeviceCapabilities::full(),
            DeviceCapabilities { coarse_grain: true, ..DeviceCapabilities::none() },
        ];
        let hints = [
            UsageHint::default(),
            UsageHint::frequent_transfer(),
            UsageHint::requires_atomics(),
        ];
        for caps in caps_sets {
            let host = HostConfig::default().with_capabilities(caps);
            let (_, f) = factory_with(host, BufferConfig::default());
            for hint in hints {
                for bytes in [0, 1, 4096, MB - 1] {
                    assert_eq!(f.determine_strategy(bytes, hint), MemoryStrategy::RegularBuffer);
                }
            }
        }
    }

    #[test]
    fn strategy_precedence() {
        use MemoryStrategy::{RegularBuffer, SvmCoarseGrain, SvmFineGrain, SvmFineGrainSystem};
        let f = factory(BufferConfig::default());
        assert_eq!(f.determine_strategy(128 * MB, UsageHint::gpu_only()), RegularBuffer);
        assert_eq!(f.determine_strategy(2 * MB, UsageHint::frequent_transfer()), SvmFineGrain);
        assert_eq!(f.determine_strategy(2 * MB, UsageHint::requires_atomics()), SvmFineGrain);
        assert_eq!(f.determine_strategy(64 * MB, UsageHint::default()), SvmFineGrainSystem);
        assert_eq!(f.determine_strategy(2 * MB, UsageHint::default()), RegularBuffer);

        let f = factory(BufferConfig { prefer_coarse_grain: true, ..BufferConfig::default() });
        assert_eq!(f.determine_strategy(2 * MB, UsageHint::default()), SvmCoarseGrain);
    }

    macro_rules! forced_strategy_tests {
        ($($name:ident => $cfg:expr, $expect:expr;)*) => {
            paste! {
                $(
                    #[test]
                    fn [<forced_ $name _wins_over_hints>]() {
                        let f = factory($cfg);
                        let hints = [
                            UsageHint::gpu_only(),
                            UsageHint::frequent_transfer(),
                            UsageHint::default(),
                        ];
                        for hint in hints {
                            for bytes in [16, 128 * MB] {
                                assert_eq!(f.determine_strategy(bytes, hint), $expect);
                            }
                        }
                    }
                )*
            }
        };
    }

    forced_strategy_tests! {
        regular => BufferConfig::regular_only(), MemoryStrategy::RegularBuffer;
        svm => BufferConfig::svm_only(), MemoryStrategy::SvmFineGrainSystem;
    }

    #[test]
    fn failing_svm_falls_back_once() {
        let host = HostConfig::default().with_svm_fail_at(4096);
        let (dev, f) = factory_with(host, BufferConfig::svm_only());
        let buf = f.create(1024, MemoryType::ReadWrite, UsageHint::default()).unwrap();
        assert!(!buf.is_svm());
        let s = f.statistics();
        assert_eq!((s.total_buffers, s.regular_buffers, s.fallbacks), (1, 1, 1));
        assert_eq!(dev.memory_stats().rejected, 1);

        let small = f.create(16, MemoryType::ReadWrite, UsageHint::default()).unwrap();
        assert!(small.is_svm());
    }

    #[test]
    fn unsupported_strategy_uses_regular() {
        let (_, f) = factory_with(
            HostConfig::default().with_capabilities(DeviceCapabilities::none()),
            BufferConfig::default(),
        );
        let buf = f
            .create_with_strategy(8, MemoryType::ReadWrite, MemoryStrategy::SvmFineGrain)
            .unwrap();
        assert_eq!(buf.strategy(), MemoryStrategy::RegularBuffer);
        assert_eq!(f.statistics().fallbacks, 1);
    }

    #[test]
    fn fallback_failure_propagates() {
        let host = HostConfig::default().with_global_memory(1024);
        let (_, f) = factory_with(host, BufferConfig::default());
        let err = f.create(4096, MemoryType::ReadWrite, UsageHint::default()).unwrap_err();
        assert!(err.is_allocation());
    }

    #[test]
    fn create_with_data_uploads() {
        let f = factory(BufferConfig::default());
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let buf = f.create_with_data(&data, MemoryType::ReadOnly, UsageHint::default()).unwrap();
        assert_eq!(buf.read::<f32>().unwrap(), data);
        assert_eq!(buf.elements(), 100);
    }

    #[test]
    fn wrapped_external_is_not_released() {
        let (dev, f) = factory_with(HostConfig::default(), BufferConfig::default());
        let raw = dev.allocate(256, Placement::Device, MemoryType::ReadWrite).unwrap();
        let wrapped =
            f.wrap_external(raw.clone(), 32, MemoryType::ReadWrite, MemoryStrategy::RegularBuffer);
        drop(wrapped);
        assert_eq!(dev.memory_stats().releases, 0);
        dev.release(&raw);
    }

    #[test]
    fn config_serde_and_presets() {
        let cfg = BufferConfig::performance();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BufferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
        let partial: BufferConfig = serde_json::from_str(r#"{"force_regular": true}"#).unwrap();
        assert!(partial.force_regular);
        assert_eq!(partial.small_threshold, BufferConfig::default().small_threshold);
        assert_eq!(BufferConfig::compatibility().small_threshold, 256 * MB);
    }
}
