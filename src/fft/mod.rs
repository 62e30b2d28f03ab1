//! Lane FFT pipeline: job parameters, batch planning, the peak search and
//! the orchestrator that runs them on a [`crate::context::ComputeContext`].

pub mod config;
pub mod params;
pub mod peaks;
pub mod plan;
pub mod processor;
pub mod profiling;
pub mod report;
pub mod transform;

/// Pads each batch lane into its transform-sized slot.
pub const PAD_KERNEL: &str = "pad_lanes_c32";
/// Top-K peak search, one work-group per lane.
pub const PEAK_KERNEL: &str = "peak_search_c32";

pub use config::BatchConfig;
pub use params::{FftJobResult, JobParams, LaneResult, PeakResult};
pub use peaks::{search_peaks, PeakRecord, PeakSearch};
pub use plan::{estimate_memory, stream_count, BatchDescriptor, BatchPlan};
pub use processor::{ExecutionPlan, LaneFftProcessor};
pub use profiling::{BatchTiming, ProfilingReport};
pub use report::{format_frequency, save_markdown, PrintOptions, ResultPrinter};
pub use transform::{TransformPlan, TransformPlanBuilder};
