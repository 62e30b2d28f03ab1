use thiserror::Error;

/// Every failure the runtime reports. Allocation failures inside strategy
/// selection are retried once by the buffer factory; everything else
/// propagates unchanged.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("allocation of {requested} bytes failed: {reason}")]
    Allocation { requested: usize, reason: String },
    #[error("capacity exceeded: requested {requested} bytes, buffer holds {capacity} bytes")]
    Capacity { requested: usize, capacity: usize },
    #[error("program build failed:\n{log}")]
    Compilation { log: String },
    #[error("kernel not found: {name}")]
    KernelNotFound { name: String },
    #[error("index {index} out of range (len = {len})")]
    Index { index: usize, len: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("device command failed: {0}")]
    Device(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
}

pub type Result<T> = std::result::Result<T, ComputeError>;

impl ComputeError {
    /// True for errors the buffer factory may recover from by retrying
    /// with an explicit-copy allocation.
    #[inline]
    pub fn is_allocation(&self) -> bool {
        matches!(self, ComputeError::Allocation { .. })
    }
}
