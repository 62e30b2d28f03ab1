use crate::error::{ComputeError, Result};
use crate::fft::peaks::PeakRecord;
use crate::utilities::helpers::{is_power_of_two, transform_size};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OVERSAMPLING: usize = 2;
pub const DEFAULT_SAMPLE_RATE_HZ: f32 = 12.0e6;
pub const MIN_PEAKS: usize = 3;
pub const MAX_JOB_PEAKS: usize = 5;

/// Shape of one lane FFT job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub lane_count: usize,
    pub samples_per_lane: usize,
    /// Spectrum points examined by the peak search, from bin 0.
    pub search_window: usize,
    pub peak_count: usize,
    /// Power-of-two padding factor applied after rounding up.
    pub oversampling: usize,
    pub sample_rate_hz: f32,
    pub task_id: String,
    pub module_name: String,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            lane_count: 0,
            samples_per_lane: 0,
            search_window: 0,
            peak_count: MIN_PEAKS,
            oversampling: DEFAULT_OVERSAMPLING,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            task_id: String::new(),
            module_name: String::new(),
        }
    }
}

impl JobParams {
    pub fn new(
        lane_count: usize,
        samples_per_lane: usize,
        search_window: usize,
        peak_count: usize,
    ) -> Self {
        Self { lane_count, samples_per_lane, search_window, peak_count, ..Self::default() }
    }

    pub fn with_task(mut self, task_id: impl Into<String>, module_name: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self.module_name = module_name.into();
        self
    }

    pub fn with_oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    pub fn with_sample_rate(mut self, hz: f32) -> Self {
        self.sample_rate_hz = hz;
        self
    }

    /// `next_power_of_two(samples_per_lane) * oversampling`.
    #[inline]
    pub fn transform_size(&self) -> usize {
        transform_size(self.samples_per_lane, self.oversampling)
    }

    /// Number of complex input points the job reads.
    #[inline]
    pub fn input_len(&self) -> usize {
        self.lane_count * self.samples_per_lane
    }

    pub fn validate(&self) -> Result<()> {
        if self.lane_count == 0 || self.samples_per_lane == 0 || self.search_window == 0 {
            return Err(ComputeError::InvalidInput(format!(
                "lane_count, samples_per_lane and search_window must be positive (got {}, {}, {})",
                self.lane_count, self.samples_per_lane, self.search_window
            )));
        }
        if !(MIN_PEAKS..=MAX_JOB_PEAKS).contains(&self.peak_count) {
            return Err(ComputeError::InvalidInput(format!(
                "peak_count must be in {MIN_PEAKS}..={MAX_JOB_PEAKS}, got {}",
                self.peak_count
            )));
        }
        if !is_power_of_two(self.oversampling) {
            return Err(ComputeError::InvalidInput(format!(
                "oversampling must be a power of two, got {}",
                self.oversampling
            )));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            let msg = format!("invalid sample rate {}", self.sample_rate_hz);
            return Err(ComputeError::InvalidInput(msg));
        }
        let n = self.transform_size();
        if self.search_window > n {
            return Err(ComputeError::InvalidInput(format!(
                "search_window {} exceeds transform size {n}",
                self.search_window
            )));
        }
        if u32::try_from(self.lane_count * n).is_err() {
            return Err(ComputeError::InvalidInput(format!(
                "{} lanes x {n} points exceed the kernel index range",
                self.lane_count
            )));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakResult {
    pub bin_index: usize,
    pub real: f32,
    pub imag: f32,
    pub magnitude: f32,
    pub phase_degrees: f32,
    /// Sub-bin offset in [-0.5, 0.5]; only set on the strongest peak.
    pub sub_bin_offset: f32,
    pub refined_frequency_hz: f32,
}

impl From<&PeakRecord> for PeakResult {
    fn from(r: &PeakRecord) -> Self {
        Self {
            bin_index: r.index as usize,
            real: r.real,
            imag: r.imag,
            magnitude: r.magnitude,
            phase_degrees: r.phase,
            sub_bin_offset: r.freq_offset,
            refined_frequency_hz: r.refined_frequency,
        }
    }
}

/// Peaks of one lane, strongest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneResult {
    pub lane: usize,
    pub transform_size: usize,
    pub peaks: Vec<PeakResult>,
    pub sub_bin_offset: f32,
    pub refined_frequency_hz: f32,
}

impl LaneResult {
    /// Builds a lane result from its device records; empty slots (zero
    /// magnitude) are dropped.
    pub fn from_records(lane: usize, transform_size: usize, records: &[PeakRecord]) -> Self {
        let peaks: Vec<PeakResult> =
            records.iter().filter(|r| r.magnitude > 0.0).map(PeakResult::from).collect();
        let (sub_bin_offset, refined_frequency_hz) =
            peaks.first().map(|p| (p.sub_bin_offset, p.refined_frequency_hz)).unwrap_or((0.0, 0.0));
        Self { lane, transform_size, peaks, sub_bin_offset, refined_frequency_hz }
    }

    pub fn strongest(&self) -> Option<&PeakResult> {
        self.peaks.first()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FftJobResult {
    pub lanes: Vec<LaneResult>,
    pub task_id: String,
    pub module_name: String,
    pub transform_size: usize,
    pub lane_count: usize,
}

impl FftJobResult {
    pub fn from_records(params: &JobParams, records: &[PeakRecord]) -> Self {
        let n = params.transform_size();
        let lanes = records
            .chunks(params.peak_count)
            .take(params.lane_count)
            .enumerate()
            .map(|(lane, recs)| LaneResult::from_records(lane, n, recs))
            .collect();
        Self {
            lanes,
            task_id: params.task_id.clone(),
            module_name: params.module_name.clone(),
            transform_size: n,
            lane_count: params.lane_count,
        }
    }
}
