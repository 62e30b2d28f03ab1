use crate::device::{Accelerator, Placement};
use crate::error::{ComputeError, Result};
use crate::utilities::enums::{MemoryStrategy, MemoryType};
use bytemuck::Pod;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Who releases a device allocation.
///
/// Only `Owned` handles are released, once, when the buffer holding them is
/// dropped. Moving the buffer moves the handle; there is no way to copy it.
#[derive(Debug)]
pub enum Ownership<M> {
    Owned(M),
    Borrowed(M),
}

impl<M> Ownership<M> {
    #[inline]
    pub fn handle(&self) -> &M {
        match self {
            Ownership::Owned(m) | Ownership::Borrowed(m) => m,
        }
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned(_))
    }
}

/// Snapshot of a buffer's attributes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub elements: usize,
    pub size_bytes: usize,
    pub memory_type: MemoryType,
    pub strategy: MemoryStrategy,
    pub is_external: bool,
    pub is_mapped: bool,
}

impl fmt::Display for BufferInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} elements, {} bytes, {}, {}{}{}",
            self.elements,
            self.size_bytes,
            self.memory_type,
            self.strategy,
            if self.is_external { ", external" } else { "" },
            if self.is_mapped { ", mapped" } else { "" },
        )
    }
}

fn check_capacity(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(ComputeError::Capacity { requested: offset.saturating_add(len), capacity }),
    }
}

fn byte_len(elements: usize, elem_size: usize) -> Result<usize> {
    elements.checked_mul(elem_size).ok_or_else(|| {
        ComputeError::InvalidInput(format!("buffer size overflow ({elements} x {elem_size})"))
    })
}

fn zeroed_vec<T: Pod>(count: usize) -> Vec<T> {
    vec![T::zeroed(); count]
}

/// Device-local allocation reached through explicit copies.
pub struct RegularBuffer<A: Accelerator> {
    device: Arc<A>,
    queue: A::Queue,
    mem: Ownership<A::Mem>,
    elements: usize,
    size_bytes: usize,
    memory_type: MemoryType,
}

impl<A: Accelerator> RegularBuffer<A> {
    /// Allocates `elements` items of `elem_size` bytes.
    pub fn new(
        device: Arc<A>,
        queue: A::Queue,
        elements: usize,
        elem_size: usize,
        memory_type: MemoryType,
    ) -> Result<Self> {
        let size_bytes = byte_len(elements, elem_size)?;
        let mem = device.allocate(size_bytes, Placement::Device, memory_type)?;
        Ok(Self { device, queue, mem: Ownership::Owned(mem), elements, size_bytes, memory_type })
    }

    /// Wraps an allocation owned elsewhere; dropping the buffer leaves it alive.
    pub fn borrowed(
        device: Arc<A>,
        queue: A::Queue,
        mem: A::Mem,
        elements: usize,
        memory_type: MemoryType,
    ) -> Self {
        let size_bytes = device.mem_size(&mem);
        Self { device, queue, mem: Ownership::Borrowed(mem), elements, size_bytes, memory_type }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let ev = self.write_bytes_async(offset, data, &[])?;
        self.device.wait(&[ev])
    }

    pub fn write_bytes_async(
        &self,
        offset: usize,
        data: &[u8],
        wait: &[A::Event],
    ) -> Result<A::Event> {
        check_capacity(offset, data.len(), self.size_bytes)?;
        self.device.write(&self.queue, self.mem.handle(), offset, data, wait)
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        check_capacity(offset, out.len(), self.size_bytes)?;
        self.device.read(&self.queue, self.mem.handle(), offset, out, &[])?;
        Ok(())
    }

    fn info(&self) -> BufferInfo {
        BufferInfo {
            elements: self.elements,
            size_bytes: self.size_bytes,
            memory_type: self.memory_type,
            strategy: MemoryStrategy::RegularBuffer,
            is_external: !self.mem.is_owned(),
            is_mapped: false,
        }
    }
}

impl<A: Accelerator> Drop for RegularBuffer<A> {
    fn drop(&mut self) {
        if let Ownership::Owned(mem) = &self.mem {
            self.device.release(mem);
        }
    }
}

/// Shared-virtual-memory allocation addressable from the host.
pub struct SvmBuffer<A: Accelerator> {
    device: Arc<A>,
    queue: A::Queue,
    mem: Ownership<A::Mem>,
    elements: usize,
    size_bytes: usize,
    memory_type: MemoryType,
    strategy: MemoryStrategy,
    mapped: AtomicBool,
}

impl<A: Accelerator> SvmBuffer<A> {
    pub fn new(
        device: Arc<A>,
        queue: A::Queue,
        elements: usize,
        elem_size: usize,
        memory_type: MemoryType,
        strategy: MemoryStrategy,
    ) -> Result<Self> {
        if !strategy.is_svm() {
            let msg = format!("{strategy} is not a shared-memory strategy");
            return Err(ComputeError::InvalidInput(msg));
        }
        let size_bytes = byte_len(elements, elem_size)?;
        let mem = device.allocate(size_bytes, Placement::Shared(strategy), memory_type)?;
        Ok(Self {
            device,
            queue,
            mem: Ownership::Owned(mem),
            elements,
            size_bytes,
            memory_type,
            strategy,
            mapped: AtomicBool::new(false),
        })
    }

    pub fn borrowed(
        device: Arc<A>,
        queue: A::Queue,
        mem: A::Mem,
        elements: usize,
        memory_type: MemoryType,
        strategy: MemoryStrategy,
    ) -> Self {
        let size_bytes = device.mem_size(&mem);
        Self {
            device,
            queue,
            mem: Ownership::Borrowed(mem),
            elements,
            size_bytes,
            memory_type,
            strategy,
            mapped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn strategy(&self) -> MemoryStrategy {
        self.strategy
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Mapping an already mapped buffer does nothing.
    pub fn map(&self) -> Result<()> {
        if self.is_mapped() {
            return Ok(());
        }
        if self.strategy.needs_explicit_coherence() {
            self.device.map(&self.queue, self.mem.handle())?;
        }
        self.mapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Unmapping a buffer that is not mapped does nothing.
    pub fn unmap(&self) -> Result<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        if self.strategy.needs_explicit_coherence() {
            self.device.unmap(&self.queue, self.mem.handle())?;
        }
        self.mapped.store(false, Ordering::Release);
        Ok(())
    }

    /// Runs `f` on the shared bytes, mapping around the call when the grain
    /// needs it and restoring the previous map state afterwards.
    pub fn with_host_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let was_mapped = self.is_mapped();
        self.map()?;
        let mut f = Some(f);
        let mut out = None;
        let access = self.device.with_host_access(self.mem.handle(), &mut |bytes| {
            if let Some(f) = f.take() {
                out = Some(f(bytes));
            }
        });
        let restore = if was_mapped { Ok(()) } else { self.unmap() };
        access?;
        restore?;
        out.ok_or_else(|| ComputeError::Device("host access callback was not invoked".into()))
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_capacity(offset, data.len(), self.size_bytes)?;
        self.with_host_bytes(|bytes| bytes[offset..offset + data.len()].copy_from_slice(data))
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        check_capacity(offset, out.len(), self.size_bytes)?;
        self.with_host_bytes(|bytes| out.copy_from_slice(&bytes[offset..offset + out.len()]))
    }

    fn info(&self) -> BufferInfo {
        BufferInfo {
            elements: self.elements,
            size_bytes: self.size_bytes,
            memory_type: self.memory_type,
            strategy: self.strategy,
            is_external: !self.mem.is_owned(),
            is_mapped: self.is_mapped(),
        }
    }
}

impl<A: Accelerator> Drop for SvmBuffer<A> {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!(error = %e, "unmap on drop failed");
        }
        if let Ownership::Owned(mem) = &self.mem {
            self.device.release(mem);
        }
    }
}

/// Accelerator memory behind one of the two storage strategies.
pub enum MemoryBuffer<A: Accelerator> {
    Regular(RegularBuffer<A>),
    Svm(SvmBuffer<A>),
}

impl<A: Accelerator> fmt::Debug for MemoryBuffer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemoryBuffer").field(&self.info()).finish()
    }
}

impl<A: Accelerator> MemoryBuffer<A> {
    pub fn info(&self) -> BufferInfo {
        match self {
            MemoryBuffer::Regular(b) => b.info(),
            MemoryBuffer::Svm(b) => b.info(),
        }
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.info().size_bytes
    }

    #[inline]
    pub fn elements(&self) -> usize {
        self.info().elements
    }

    #[inline]
    pub fn strategy(&self) -> MemoryStrategy {
        self.info().strategy
    }

    #[inline]
    pub fn is_svm(&self) -> bool {
        matches!(self, MemoryBuffer::Svm(_))
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.info().is_external
    }

    /// Handle to pass as a kernel argument or transform operand.
    pub fn device_mem(&self) -> &A::Mem {
        match self {
            MemoryBuffer::Regular(b) => b.mem.handle(),
            MemoryBuffer::Svm(b) => b.mem.handle(),
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        match self {
            MemoryBuffer::Regular(b) => b.write_bytes(offset, data),
            MemoryBuffer::Svm(b) => b.write_bytes(offset, data),
        }
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        match self {
            MemoryBuffer::Regular(b) => b.read_bytes(offset, out),
            MemoryBuffer::Svm(b) => b.read_bytes(offset, out),
        }
    }

    /// Blocking write of `data` at the start of the buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Non-blocking write. Shared-memory buffers copy through the host
    /// pointer immediately, so the returned event is an already satisfiable
    /// marker on the buffer's queue.
    pub fn write_async<T: Pod>(&self, data: &[T], wait: &[A::Event]) -> Result<A::Event> {
        match self {
            MemoryBuffer::Regular(b) => b.write_bytes_async(0, bytemuck::cast_slice(data), wait),
            MemoryBuffer::Svm(b) => {
                b.device.wait(wait)?;
                b.write_bytes(0, bytemuck::cast_slice(data))?;
                b.device.marker(&b.queue, &[])
            }
        }
    }

    /// Reads the whole buffer as `T`s.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        let count = self.size_bytes() / std::mem::size_of::<T>().max(1);
        self.read_partial(0, count)
    }

    /// Reads `count` items starting at item `offset`.
    pub fn read_partial<T: Pod>(&self, offset: usize, count: usize) -> Result<Vec<T>> {
        let elem = std::mem::size_of::<T>();
        let mut out = zeroed_vec::<T>(count);
        let byte_offset = offset
            .checked_mul(elem)
            .ok_or(ComputeError::Capacity { requested: usize::MAX, capacity: self.size_bytes() })?;
        self.read_bytes(byte_offset, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// No-op for explicit-copy buffers; idempotent for shared memory.
    pub fn map(&self) -> Result<()> {
        match self {
            MemoryBuffer::Regular(_) => Ok(()),
            MemoryBuffer::Svm(b) => b.map(),
        }
    }

    pub fn unmap(&self) -> Result<()> {
        match self {
            MemoryBuffer::Regular(_) => Ok(()),
            MemoryBuffer::Svm(b) => b.unmap(),
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        match self {
            MemoryBuffer::Regular(_) => false,
            MemoryBuffer::Svm(b) => b.is_mapped(),
        }
    }

    /// Maps now and unmaps when the guard drops, unless the buffer was
    /// already mapped.
    pub fn scoped_map(&self) -> Result<ScopedMap<'_, A>> {
        let was_mapped = self.is_mapped();
        self.map()?;
        Ok(ScopedMap { buffer: self, was_mapped })
    }

    /// Direct access to the shared bytes. Explicit-copy buffers have no host
    /// pointer.
    pub fn with_host_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        match self {
            MemoryBuffer::Regular(_) => {
                let msg = "explicit-copy buffers have no host-visible pointer";
                Err(ComputeError::Unsupported(msg.into()))
            }
            MemoryBuffer::Svm(b) => b.with_host_bytes(f),
        }
    }
}

/// Map guard returned by [`MemoryBuffer::scoped_map`].
pub struct ScopedMap<'a, A: Accelerator> {
    buffer: &'a MemoryBuffer<A>,
    was_mapped: bool,
}

impl<'a, A: Accelerator> ScopedMap<'a, A> {
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.buffer.with_host_bytes(f)
    }
}

impl<'a, A: Accelerator> Drop for ScopedMap<'a, A> {
    fn drop(&mut self) {
        if !self.was_mapped {
            if let Err(e) = self.buffer.unmap() {
                warn!(error = %e, "scoped unmap failed");
            }
        }
    }
}
