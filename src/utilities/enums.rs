use serde::{Deserialize, Serialize};
use std::fmt;

/// Intended access direction of a device allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::ReadWrite
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryType::ReadOnly => "read-only",
            MemoryType::WriteOnly => "write-only",
            MemoryType::ReadWrite => "read-write",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MemoryStrategy {
    Auto,
    RegularBuffer,
    SvmCoarseGrain,
    SvmFineGrain,
    SvmFineGrainSystem,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        MemoryStrategy::Auto
    }
}

impl MemoryStrategy {
    #[inline(always)]
    pub const fn is_svm(self) -> bool {
        matches!(
            self,
            MemoryStrategy::SvmCoarseGrain
                | MemoryStrategy::SvmFineGrain
                | MemoryStrategy::SvmFineGrainSystem
        )
    }

    /// Fine-grain levels keep host and device coherent without map/unmap.
    #[inline(always)]
    pub const fn needs_explicit_coherence(self) -> bool {
        matches!(self, MemoryStrategy::SvmCoarseGrain)
    }
}

impl fmt::Display for MemoryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryStrategy::Auto => "auto",
            MemoryStrategy::RegularBuffer => "regular",
            MemoryStrategy::SvmCoarseGrain => "svm-coarse",
            MemoryStrategy::SvmFineGrain => "svm-fine",
            MemoryStrategy::SvmFineGrainSystem => "svm-fine-system",
        };
        f.write_str(s)
    }
}

/// How the lane FFT orchestrator executes a job.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    Auto,
    SingleShot,
    Sequential,
    Parallel,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Auto
    }
}

impl ExecutionMode {
    #[inline(always)]
    pub const fn is_batched(self) -> bool {
        matches!(self, ExecutionMode::Sequential | ExecutionMode::Parallel)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ExecutionMode::Auto),
            "single" | "singleshot" | "single_shot" => Some(ExecutionMode::SingleShot),
            "sequential" | "seq" => Some(ExecutionMode::Sequential),
            "parallel" | "streams" => Some(ExecutionMode::Parallel),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Auto => "auto",
            ExecutionMode::SingleShot => "single-shot",
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        };
        f.write_str(s)
    }
}
