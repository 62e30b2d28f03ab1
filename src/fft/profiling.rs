use crate::utilities::enums::ExecutionMode;
use serde::Serialize;
use std::fmt;

/// Device time of one batch's pipeline stages, in milliseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatchTiming {
    pub index: usize,
    pub start_lane: usize,
    pub lane_count: usize,
    pub stream: usize,
    pub pad_ms: f64,
    pub transform_ms: f64,
    pub post_ms: f64,
}

impl BatchTiming {
    #[inline]
    pub fn device_ms(&self) -> f64 {
        self.pad_ms + self.transform_ms + self.post_ms
    }
}

/// Per-stage timings of the last job. Stage values are summed over batches;
/// `total_ms` is host wall time for the whole call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProfilingReport {
    pub mode: Option<ExecutionMode>,
    pub streams: usize,
    pub upload_ms: f64,
    pub pad_ms: f64,
    pub transform_ms: f64,
    pub post_ms: f64,
    pub download_ms: f64,
    pub total_ms: f64,
    pub batches: Vec<BatchTiming>,
}

impl ProfilingReport {
    pub fn push_batch(&mut self, timing: BatchTiming) {
        self.pad_ms += timing.pad_ms;
        self.transform_ms += timing.transform_ms;
        self.post_ms += timing.post_ms;
        self.batches.push(timing);
    }

    #[inline]
    pub fn device_ms(&self) -> f64 {
        self.upload_ms + self.pad_ms + self.transform_ms + self.post_ms + self.download_ms
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        writeln!(f, "Mode: {mode}, streams: {}, batches: {}", self.streams, self.batches.len())?;
        writeln!(f, "  upload    : {:>10.3} ms", self.upload_ms)?;
        writeln!(f, "  pad       : {:>10.3} ms", self.pad_ms)?;
        writeln!(f, "  transform : {:>10.3} ms", self.transform_ms)?;
        writeln!(f, "  post      : {:>10.3} ms", self.post_ms)?;
        writeln!(f, "  download  : {:>10.3} ms", self.download_ms)?;
        write!(f, "  total     : {:>10.3} ms", self.total_ms)?;
        if self.batches.len() > 1 {
            for b in &self.batches {
                write!(
                    f,
                    "\n    batch {:>3} lanes {:>5}..{:<5} stream {} : {:.3} ms",
                    b.index,
                    b.start_lane,
                    b.start_lane + b.lane_count,
                    b.stream,
                    b.device_ms()
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_batch_accumulates() {
        let mut r = ProfilingReport::default();
        let timing = BatchTiming { pad_ms: 1.0, post_ms: 0.5, ..Default::default() };
        r.push_batch(BatchTiming { transform_ms: 2.0, ..timing });
        r.push_batch(BatchTiming { index: 1, transform_ms: 1.0, ..timing });
        assert_eq!((r.pad_ms, r.transform_ms, r.post_ms), (2.0, 3.0, 1.0));
        assert_eq!(r.batches[0].device_ms(), 3.5);
        let text = r.to_string();
        assert!(text.contains("batch   1"));
    }
}
