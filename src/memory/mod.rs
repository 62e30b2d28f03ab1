//! Accelerator memory: ownership-typed buffers over two storage strategies
//! and the factory that chooses between them.

pub mod buffer;
pub mod factory;

pub use buffer::{BufferInfo, MemoryBuffer, Ownership, RegularBuffer, ScopedMap, SvmBuffer};
pub use factory::{BufferConfig, BufferFactory, BufferStatistics, UsageHint};
