use crate::device::Placement;
use crate::error::{ComputeError, Result};
use crate::utilities::enums::{MemoryStrategy, MemoryType};
use aligned_vec::{AVec, CACHELINE_ALIGN};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backing store of one host-device allocation.
#[derive(Debug)]
pub struct HostAllocation {
    pub(crate) id: u64,
    pub(crate) bytes: usize,
    pub(crate) placement: Placement,
    pub(crate) access: MemoryType,
    data: RwLock<AVec<u8>>,
    mapped: AtomicBool,
}

impl HostAllocation {
    fn zeroed(id: u64, bytes: usize, placement: Placement, access: MemoryType) -> Self {
        let mut data: AVec<u8> = AVec::with_capacity(CACHELINE_ALIGN, bytes);
        data.resize(bytes, 0u8);
        Self {
            id,
            bytes,
            placement,
            access,
            data: RwLock::new(data),
            mapped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AVec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AVec<u8>> {
        self.data.write()
    }

    #[inline]
    pub(crate) fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_mapped(&self, mapped: bool) {
        self.mapped.store(mapped, Ordering::Release);
    }

    /// Kernels and transforms may read this allocation.
    pub(crate) fn check_device_read(&self) -> std::result::Result<(), String> {
        match self.access {
            MemoryType::WriteOnly => {
                Err(format!("allocation {} is write-only for the device", self.id))
            }
            _ => Ok(()),
        }
    }

    /// Kernels and transforms may write this allocation.
    pub(crate) fn check_device_write(&self) -> std::result::Result<(), String> {
        match self.access {
            MemoryType::ReadOnly => {
                Err(format!("allocation {} is read-only for the device", self.id))
            }
            _ => Ok(()),
        }
    }

    #[inline]
    pub(crate) fn is_coarse_grain(&self) -> bool {
        self.placement == Placement::Shared(MemoryStrategy::SvmCoarseGrain)
    }
}

/// Runs `f` with `src` locked for reading and `dst` for writing. Locks are
/// taken in allocation-id order so concurrent commands cannot deadlock.
pub fn with_src_dst<R>(
    src: &HostAllocation,
    dst: &HostAllocation,
    f: impl FnOnce(&[u8], &mut [u8]) -> R,
) -> std::result::Result<R, String> {
    if src.id == dst.id {
        return Err(format!("allocation {} used as both source and destination", src.id));
    }
    if src.id < dst.id {
        let s = src.read();
        let mut d = dst.write();
        Ok(f(&s, &mut d))
    } else {
        let mut d = dst.write();
        let s = src.read();
        Ok(f(&s, &mut d))
    }
}

/// Opaque handle to a host-device allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostMem {
    pub(crate) id: u64,
    pub(crate) bytes: usize,
    pub(crate) placement: Placement,
}

impl HostMem {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }
}

/// Allocation counters, used to check release discipline.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostMemoryStats {
    pub allocations: u64,
    pub releases: u64,
    pub invalid_releases: u64,
    pub live: usize,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub svm_allocations: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub(crate) struct MemoryLedger {
    global_memory: usize,
    next_id: u64,
    live: HashMap<u64, Arc<HostAllocation>>,
    stats: HostMemoryStats,
}

impl MemoryLedger {
    pub(crate) fn new(global_memory: usize) -> Self {
        Self {
            global_memory,
            next_id: 1,
            live: HashMap::new(),
            stats: HostMemoryStats::default(),
        }
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.global_memory.saturating_sub(self.stats.bytes_in_use)
    }

    pub(crate) fn stats(&self) -> HostMemoryStats {
        self.stats
    }

    pub(crate) fn reject(&mut self, requested: usize, reason: impl Into<String>) -> ComputeError {
        self.stats.rejected += 1;
        ComputeError::Allocation { requested, reason: reason.into() }
    }

    pub(crate) fn allocate(
        &mut self,
        bytes: usize,
        placement: Placement,
        access: MemoryType,
    ) -> Result<HostMem> {
        if bytes > self.free_bytes() {
            let free = self.free_bytes();
            return Err(self.reject(bytes, format!("out of device memory ({free} bytes free)")));
        }
        let id = self.next_id;
        self.next_id += 1;
        let alloc = Arc::new(HostAllocation::zeroed(id, bytes, placement, access));
        self.live.insert(id, alloc);
        self.stats.allocations += 1;
        if matches!(placement, Placement::Shared(_)) {
            self.stats.svm_allocations += 1;
        }
        self.stats.live = self.live.len();
        self.stats.bytes_in_use += bytes;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.bytes_in_use);
        Ok(HostMem { id, bytes, placement })
    }

    /// Returns false when the handle was unknown or already released.
    pub(crate) fn release(&mut self, mem: &HostMem) -> bool {
        match self.live.remove(&mem.id) {
            Some(alloc) => {
                self.stats.releases += 1;
                self.stats.live = self.live.len();
                self.stats.bytes_in_use -= alloc.bytes;
                true
            }
            None => {
                self.stats.invalid_releases += 1;
                false
            }
        }
    }

    pub(crate) fn resolve(&self, mem: &HostMem) -> Result<Arc<HostAllocation>> {
        self.live
            .get(&mem.id)
            .cloned()
            .ok_or_else(|| {
                ComputeError::Device(format!("memory handle {} used after release", mem.id))
            })
    }
}
