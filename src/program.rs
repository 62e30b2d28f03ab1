//! Compiled programs and their kernels, cached by source content hash.

use crate::device::Accelerator;
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// blake3 digest of a program source.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey([u8; 32]);

impl ProgramKey {
    pub fn of(source: &str) -> Self {
        ProgramKey(*blake3::hash(source.as_bytes()).as_bytes())
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgramKey({self})")
    }
}

/// A built program plus its name-keyed kernel handles. On drop every cached
/// kernel is released before the program itself.
pub struct CompiledProgram<A: Accelerator> {
    device: Arc<A>,
    key: ProgramKey,
    kernels: Mutex<HashMap<String, A::Kernel>>,
    program: Option<A::Program>,
}

impl<A: Accelerator> CompiledProgram<A> {
    pub fn build(device: Arc<A>, source: &str) -> Result<Self> {
        let program = device.build_program(source)?;
        Ok(Self {
            device,
            key: ProgramKey::of(source),
            kernels: Mutex::new(HashMap::new()),
            program: Some(program),
        })
    }

    #[inline]
    pub fn key(&self) -> ProgramKey {
        self.key
    }

    fn raw(&self) -> &A::Program {
        // Only `Drop` takes the program out.
        match &self.program {
            Some(p) => p,
            None => unreachable!("program accessed during drop"),
        }
    }

    /// Cached kernel handle; the returned reference keeps this program alive.
    pub fn kernel(self: &Arc<Self>, name: &str) -> Result<KernelRef<A>> {
        let mut kernels = self.kernels.lock();
        let kernel = match kernels.get(name) {
            Some(k) => k.clone(),
            None => {
                let k = self.device.create_kernel(self.raw(), name)?;
                kernels.insert(name.to_string(), k.clone());
                k
            }
        };
        Ok(KernelRef { program: self.clone(), kernel })
    }

    /// Fresh kernel object owned by the returned handle, for use on one
    /// stream while other streams run their own replicas.
    pub fn instantiate_kernel(self: &Arc<Self>, name: &str) -> Result<KernelInstance<A>> {
        let kernel = self.device.create_kernel(self.raw(), name)?;
        Ok(KernelInstance { program: self.clone(), kernel: Some(kernel) })
    }

    pub fn kernel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kernels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl<A: Accelerator> Drop for CompiledProgram<A> {
    fn drop(&mut self) {
        for (_, kernel) in self.kernels.get_mut().drain() {
            self.device.release_kernel(kernel);
        }
        if let Some(program) = self.program.take() {
            self.device.release_program(program);
        }
    }
}

impl<A: Accelerator> fmt::Debug for CompiledProgram<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("key", &self.key)
            .field("kernels", &self.kernel_names())
            .finish()
    }
}

/// Shared kernel handle from a program's cache.
pub struct KernelRef<A: Accelerator> {
    program: Arc<CompiledProgram<A>>,
    kernel: A::Kernel,
}

impl<A: Accelerator> KernelRef<A> {
    pub fn program(&self) -> &Arc<CompiledProgram<A>> {
        &self.program
    }
}

impl<A: Accelerator> Clone for KernelRef<A> {
    fn clone(&self) -> Self {
        Self { program: self.program.clone(), kernel: self.kernel.clone() }
    }
}

impl<A: Accelerator> Deref for KernelRef<A> {
    type Target = A::Kernel;
    fn deref(&self) -> &A::Kernel {
        &self.kernel
    }
}

/// Kernel replica released when dropped, before its program can be.
pub struct KernelInstance<A: Accelerator> {
    program: Arc<CompiledProgram<A>>,
    kernel: Option<A::Kernel>,
}

impl<A: Accelerator> KernelInstance<A> {
    pub fn program(&self) -> &Arc<CompiledProgram<A>> {
        &self.program
    }
}

impl<A: Accelerator> Deref for KernelInstance<A> {
    type Target = A::Kernel;
    fn deref(&self) -> &A::Kernel {
        match &self.kernel {
            Some(k) => k,
            None => unreachable!("kernel accessed during drop"),
        }
    }
}

impl<A: Accelerator> Drop for KernelInstance<A> {
    fn drop(&mut self) {
        if let Some(kernel) = self.kernel.take() {
            self.program.device.release_kernel(kernel);
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Program cache: {} programs, {} hits, {} misses ({:.1}% hit rate)",
            self.size,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )
    }
}

pub struct ProgramCache<A: Accelerator> {
    device: Arc<A>,
    entries: RwLock<HashMap<ProgramKey, Arc<CompiledProgram<A>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<A: Accelerator> ProgramCache<A> {
    pub fn new(device: Arc<A>) -> Self {
        Self {
            device,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the shared program for `source`, building it on first use.
    /// Building happens outside the lock; when two threads race on the same
    /// source the first insert wins and the other build is dropped.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<CompiledProgram<A>>> {
        let key = ProgramKey::of(source);
        if let Some(p) = self.entries.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "program cache hit");
            return Ok(p.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let built = Arc::new(CompiledProgram::build(self.device.clone(), source)?);
        let shared = self.entries.write().entry(key).or_insert(built).clone();
        info!(%key, "program compiled and cached");
        Ok(shared)
    }

    pub fn get(&self, source: &str) -> Option<Arc<CompiledProgram<A>>> {
        self.entries.read().get(&ProgramKey::of(source)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the cache's references; programs still held elsewhere live on.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            size: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
