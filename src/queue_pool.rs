//! Fixed set of execution queues with round-robin and indexed selection.
//!
//! Per-queue counters only feed [`QueueStatistics`]; selection is by index
//! so batch-to-stream assignment stays reproducible.

use crate::device::Accelerator;
use crate::error::{ComputeError, Result};
use crate::utilities::helpers::detect_parallelism;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Slot<Q> {
    queue: Q,
    ops: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub operations: Vec<u64>,
    pub total: u64,
}

impl QueueStatistics {
    /// Share of all operations issued to queue `i`, in percent.
    pub fn load_percent(&self, i: usize) -> f64 {
        match (self.operations.get(i), self.total) {
            (Some(&n), t) if t > 0 => n as f64 * 100.0 / t as f64,
            _ => 0.0,
        }
    }
}

impl fmt::Display for QueueStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Queue pool: {} queues, {} operations", self.operations.len(), self.total)?;
        for (i, n) in self.operations.iter().enumerate() {
            writeln!(f, "  queue {i:>2}: {n:>8} ops ({:5.1}%)", self.load_percent(i))?;
        }
        Ok(())
    }
}

pub struct QueuePool<A: Accelerator> {
    device: Arc<A>,
    slots: RwLock<Vec<Slot<A::Queue>>>,
    cursor: AtomicUsize,
}

impl<A: Accelerator> QueuePool<A> {
    pub fn new(device: Arc<A>) -> Self {
        Self { device, slots: RwLock::new(Vec::new()), cursor: AtomicUsize::new(0) }
    }

    /// Creates `n` queues (0 means one per hardware thread). Calling it again
    /// before [`QueuePool::cleanup`] keeps the existing queues.
    pub fn initialize(&self, n: usize) -> Result<()> {
        let mut slots = self.slots.write();
        if !slots.is_empty() {
            warn!(queues = slots.len(), "queue pool already initialized, ignoring");
            return Ok(());
        }
        let n = if n == 0 { detect_parallelism() } else { n };
        let mut created = Vec::with_capacity(n);
        for _ in 0..n {
            created.push(Slot { queue: self.device.create_queue()?, ops: AtomicU64::new(0) });
        }
        *slots = created;
        self.cursor.store(0, Ordering::Relaxed);
        info!(queues = n, "queue pool initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.slots.read().is_empty()
    }

    pub fn size(&self) -> usize {
        self.slots.read().len()
    }

    fn not_initialized() -> ComputeError {
        ComputeError::Initialization("queue pool not initialized".into())
    }

    /// Next queue in round-robin order, with its index.
    pub fn next_indexed(&self) -> Result<(usize, A::Queue)> {
        let slots = self.slots.read();
        if slots.is_empty() {
            return Err(Self::not_initialized());
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        slots[i].ops.fetch_add(1, Ordering::Relaxed);
        Ok((i, slots[i].queue.clone()))
    }

    pub fn next_queue(&self) -> Result<A::Queue> {
        self.next_indexed().map(|(_, q)| q)
    }

    pub fn queue(&self, i: usize) -> Result<A::Queue> {
        let slots = self.slots.read();
        let slot = slots.get(i).ok_or(ComputeError::Index { index: i, len: slots.len() })?;
        slot.ops.fetch_add(1, Ordering::Relaxed);
        Ok(slot.queue.clone())
    }

    /// Queue with the fewest recorded operations (lowest index on ties).
    pub fn least_used_queue(&self) -> Result<(usize, A::Queue)> {
        let slots = self.slots.read();
        let (i, slot) = slots
            .iter()
            .enumerate()
            .min_by_key(|(i, s)| (s.ops.load(Ordering::Relaxed), *i))
            .ok_or_else(Self::not_initialized)?;
        slot.ops.fetch_add(1, Ordering::Relaxed);
        Ok((i, slot.queue.clone()))
    }

    /// Index the next round-robin call will return.
    pub fn current_index(&self) -> usize {
        match self.size() {
            0 => 0,
            n => self.cursor.load(Ordering::Relaxed) % n,
        }
    }

    pub fn finish(&self, i: usize) -> Result<()> {
        let slots = self.slots.read();
        let slot = slots.get(i).ok_or(ComputeError::Index { index: i, len: slots.len() })?;
        self.device.finish(&slot.queue)
    }

    pub fn finish_all(&self) -> Result<()> {
        for slot in self.slots.read().iter() {
            self.device.finish(&slot.queue)?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        for slot in self.slots.read().iter() {
            self.device.flush(&slot.queue)?;
        }
        Ok(())
    }

    pub fn statistics(&self) -> QueueStatistics {
        let operations: Vec<u64> =
            self.slots.read().iter().map(|s| s.ops.load(Ordering::Relaxed)).collect();
        let total = operations.iter().sum();
        QueueStatistics { operations, total }
    }

    /// Drains and drops every queue; counters reset with them.
    pub fn cleanup(&self) {
        let mut slots = self.slots.write();
        for slot in slots.iter() {
            if let Err(e) = self.device.finish(&slot.queue) {
                warn!(error = %e, "queue drain failed during cleanup");
            }
        }
        slots.clear();
        self.cursor.store(0, Ordering::Relaxed);
        debug!("queue pool cleaned up");
    }
}

impl<A: Accelerator> Drop for QueuePool<A> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostAccelerator;

    fn pool(n: usize) -> QueuePool<HostAccelerator> {
        let p = QueuePool::new(Arc::new(HostAccelerator::default()));
        p.initialize(n).unwrap();
        p
    }

    #[test]
    fn round_robin_cycles_and_counts() {
        let p = pool(3);
        let ids: Vec<usize> = (0..7).map(|_| p.next_queue().unwrap().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 0]);
        let s = p.statistics();
        assert_eq!(s.operations, vec![3, 2, 2]);
        assert_eq!(s.total, 7);
        assert_eq!(p.current_index(), 1);
    }

    #[test]
    fn index_out_of_range() {
        let p = pool(2);
        assert!(p.queue(1).is_ok());
        assert!(matches!(p.queue(2), Err(ComputeError::Index { index: 2, len: 2 })));
        assert!(matches!(p.finish(5), Err(ComputeError::Index { .. })));
    }

    #[test]
    fn reinitialize_is_noop() {
        let p = pool(2);
        p.initialize(5).unwrap();
        assert_eq!(p.size(), 2);
        p.cleanup();
        assert!(!p.is_initialized());
        p.initialize(4).unwrap();
        assert_eq!(p.size(), 4);
        assert_eq!(p.statistics().total, 0);
    }

    #[test]
    fn uninitialized_pool_errors() {
        let p: QueuePool<HostAccelerator> = QueuePool::new(Arc::new(HostAccelerator::default()));
        assert!(matches!(p.next_queue(), Err(ComputeError::Initialization(_))));
        assert!(p.least_used_queue().is_err());
        p.finish_all().unwrap();
    }

    #[test]
    fn least_used_prefers_idle_queue() {
        let p = pool(3);
        p.queue(0).unwrap();
        p.queue(1).unwrap();
        let (i, _) = p.least_used_queue().unwrap();
        assert_eq!(i, 2);
    }

    #[test]
    fn default_size_is_hardware_concurrency() {
        let p = pool(0);
        assert_eq!(p.size(), detect_parallelism());
        p.finish_all().unwrap();
        p.flush_all().unwrap();
        let text = p.statistics().to_string();
        assert!(text.contains("queue  0"));
    }
}
