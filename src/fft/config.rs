use crate::utilities::enums::ExecutionMode;
use crate::utilities::helpers::env_parse;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Batching knobs of the lane FFT orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Fraction of global device memory a job may use before it is batched.
    pub memory_usage_limit: f64,
    /// Fraction of lanes per batch.
    pub batch_ratio: f64,
    pub max_streams: usize,
    pub mode: ExecutionMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            memory_usage_limit: 0.5,
            batch_ratio: 0.22,
            max_streams: 3,
            mode: ExecutionMode::Auto,
        }
    }
}

impl BatchConfig {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_batch_ratio(mut self, ratio: f64) -> Self {
        self.batch_ratio = ratio;
        self
    }

    pub fn with_max_streams(mut self, n: usize) -> Self {
        self.max_streams = n;
        self
    }

    /// Overlays `RADAR_FFT_MEMORY_LIMIT`, `RADAR_FFT_BATCH_RATIO`,
    /// `RADAR_FFT_STREAMS` and `RADAR_FFT_MODE`.
    pub fn from_env(mut self) -> Self {
        if let Some(v) = env_parse::<f64>("RADAR_FFT_MEMORY_LIMIT") {
            self.memory_usage_limit = v;
        }
        if let Some(v) = env_parse::<f64>("RADAR_FFT_BATCH_RATIO") {
            self.batch_ratio = v;
        }
        if let Some(v) = env_parse::<usize>("RADAR_FFT_STREAMS") {
            self.max_streams = v;
        }
        if let Ok(v) = std::env::var("RADAR_FFT_MODE") {
            match ExecutionMode::parse(&v) {
                Some(mode) => self.mode = mode,
                None => warn!(value = %v, "ignoring unknown RADAR_FFT_MODE"),
            }
        }
        self.sanitized()
    }

    /// Clamps ratios into (0, 1] and the stream count to at least 1.
    pub fn sanitized(mut self) -> Self {
        if !(self.memory_usage_limit > 0.0 && self.memory_usage_limit <= 1.0) {
            warn!(value = self.memory_usage_limit, "memory_usage_limit out of range, using 0.5");
            self.memory_usage_limit = 0.5;
        }
        if !(self.batch_ratio > 0.0 && self.batch_ratio <= 1.0) {
            warn!(value = self.batch_ratio, "batch_ratio out of range, using 0.22");
            self.batch_ratio = 0.22;
        }
        self.max_streams = self.max_streams.max(1);
        self
    }
}
