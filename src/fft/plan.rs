//! Memory estimate, batch plan and stream count of a lane FFT job.

use super::config::BatchConfig;
use super::params::JobParams;
use crate::utilities::helpers::div_ceil;
use num_complex::Complex32;
use serde::Serialize;

/// Hard ceiling on concurrent streams.
pub const MAX_PARALLEL_STREAMS: usize = 8;

/// Batches whose tail would hold this many lanes or fewer are folded into
/// the previous batch.
pub const FOLD_THRESHOLD: usize = 2;

const COMPLEX_BYTES: usize = std::mem::size_of::<Complex32>();
const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

/// Bytes a single-shot run of `params` needs: input, double-buffered
/// transform scratch and post-processing scratch.
pub fn estimate_memory(params: &JobParams) -> usize {
    let lanes = params.lane_count;
    let input = params.input_len() * COMPLEX_BYTES;
    let transform = lanes * params.transform_size() * COMPLEX_BYTES * 2;
    let post = lanes * params.search_window * (COMPLEX_BYTES + FLOAT_BYTES);
    input + transform + post
}

/// Byte budget a job may use on a device with `global_memory` bytes.
#[inline]
pub fn memory_budget(global_memory: usize, config: &BatchConfig) -> usize {
    (global_memory as f64 * config.memory_usage_limit) as usize
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchDescriptor {
    pub index: usize,
    pub start_lane: usize,
    pub lane_count: usize,
    pub stream: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub lane_count: usize,
    pub batch_size: usize,
    pub num_batches: usize,
    /// Largest batch; scratch buffers and transform plans are sized to it.
    pub max_batch: usize,
}

impl BatchPlan {
    pub fn new(lane_count: usize, batch_ratio: f64) -> Self {
        if lane_count == 0 {
            return Self { lane_count, batch_size: 0, num_batches: 0, max_batch: 0 };
        }
        let batch_size = ((lane_count as f64 * batch_ratio).round() as usize).clamp(1, lane_count);
        Self::with_batch_size(lane_count, batch_size)
    }

    pub fn with_batch_size(lane_count: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, lane_count.max(1));
        let mut num_batches = div_ceil(lane_count, batch_size);
        let tail = lane_count - (num_batches.saturating_sub(1)) * batch_size;
        if num_batches > 1 && tail <= FOLD_THRESHOLD {
            num_batches -= 1;
        }
        let last = lane_count - (num_batches - 1) * batch_size;
        Self { lane_count, batch_size, num_batches, max_batch: batch_size.max(last) }
    }

    /// Single batch covering every lane.
    pub fn single(lane_count: usize) -> Self {
        Self { lane_count, batch_size: lane_count, num_batches: 1, max_batch: lane_count }
    }

    /// Batches in order; stream `index % streams`.
    pub fn batches(&self, streams: usize) -> Vec<BatchDescriptor> {
        let streams = streams.max(1);
        (0..self.num_batches)
            .map(|index| {
                let start_lane = index * self.batch_size;
                let lane_count = if index + 1 == self.num_batches {
                    self.lane_count - start_lane
                } else {
                    self.batch_size
                };
                BatchDescriptor { index, start_lane, lane_count, stream: index % streams }
            })
            .collect()
    }
}

/// Streams usable for `plan`: bounded by the configured maximum, the batch
/// count, the hard ceiling and the queue pool. Each stream needs two
/// transform-sized scratch buffers out of whatever is smaller, the budget
/// left after the input or the memory the device reports free.
pub fn stream_count(
    params: &JobParams,
    plan: &BatchPlan,
    config: &BatchConfig,
    global_memory: usize,
    free_memory: Option<usize>,
    pool_size: usize,
) -> usize {
    let per_stream = 2 * plan.max_batch * params.transform_size() * COMPLEX_BYTES;
    let input = params.input_len() * COMPLEX_BYTES;
    let mut free = memory_budget(global_memory, config).saturating_sub(input);
    if let Some(device_free) = free_memory {
        free = free.min(device_free);
    }
    let by_memory = if per_stream == 0 { MAX_PARALLEL_STREAMS } else { free / per_stream };
    config
        .max_streams
        .min(plan.num_batches)
        .min(MAX_PARALLEL_STREAMS)
        .min(pool_size)
        .min(by_memory)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_small_tail_into_previous_batch() {
        let p = BatchPlan::with_batch_size(130, 64);
        assert_eq!((p.num_batches, p.max_batch), (2, 66));
        let sizes: Vec<usize> = p.batches(1).iter().map(|b| b.lane_count).collect();
        assert_eq!(sizes, vec![64, 66]);
    }

    #[test]
    fn ratio_rounds_to_batch_size() {
        // 130 * 0.49 = 63.7 -> 64
        let p = BatchPlan::new(130, 0.49);
        assert_eq!(p.batch_size, 64);
        assert_eq!(p.batches(1).iter().map(|b| b.lane_count).collect::<Vec<_>>(), vec![64, 66]);
    }

    #[test]
    fn tail_of_three_is_kept() {
        let p = BatchPlan::with_batch_size(131, 64);
        assert_eq!(p.num_batches, 3);
        assert_eq!(p.max_batch, 64);
        assert_eq!(p.batches(1).last().map(|b| b.lane_count), Some(3));
    }

    #[test]
    fn batches_cover_every_lane_once() {
        for lanes in 1..200 {
            for ratio in [0.01, 0.1, 0.22, 0.5, 1.0] {
                let p = BatchPlan::new(lanes, ratio);
                let bs = p.batches(3);
                assert_eq!(bs.iter().map(|b| b.lane_count).sum::<usize>(), lanes);
                let mut next = 0;
                for b in &bs {
                    assert_eq!(b.start_lane, next);
                    assert!(b.lane_count <= p.max_batch);
                    assert_eq!(b.stream, b.index % 3);
                    next += b.lane_count;
                }
            }
        }
    }

    #[test]
    fn ratio_is_clamped() {
        assert_eq!(BatchPlan::new(5, 0.01).batch_size, 1);
        assert_eq!(BatchPlan::new(5, 2.0).batch_size, 5);
        assert_eq!(BatchPlan::new(5, 2.0).num_batches, 1);
    }

    #[test]
    fn estimate_matches_formula() {
        let p = JobParams::new(4, 1024, 1024, 3);
        let expected = 4 * 1024 * 8 + 4 * 2048 * 8 * 2 + 4 * 1024 * 12;
        assert_eq!(estimate_memory(&p), expected);
    }

    #[test]
    fn stream_count_is_capped() {
        let params = JobParams::new(100, 1024, 1024, 3);
        let plan = BatchPlan::with_batch_size(100, 10);
        let cfg = BatchConfig { max_streams: 16, ..Default::default() };
        let wide = BatchConfig { max_streams: 64, ..Default::default() };
        let gb = 1usize << 30;
        assert_eq!(stream_count(&params, &plan, &cfg, gb, None, 16), MAX_PARALLEL_STREAMS);
        assert_eq!(stream_count(&params, &plan, &cfg, gb, None, 2), 2);
        assert_eq!(stream_count(&params, &plan, &BatchConfig::default(), gb, None, 16), 3);

        // Budget 0.5 MiB minus 800 KiB of input leaves nothing: one stream.
        assert_eq!(stream_count(&params, &plan, &cfg, 1 << 20, None, 16), 1);
        // 16 MiB budget, 800 KiB input, 320 KiB per stream.
        let per_stream = 2 * 10 * 2048 * 8;
        let expected = ((8 << 20) - 100 * 1024 * 8) / per_stream;
        assert_eq!(
            stream_count(&params, &plan, &wide, 16 << 20, None, 64),
            expected.min(MAX_PARALLEL_STREAMS)
        );
    }

    #[test]
    fn stream_count_respects_device_free_memory() {
        let params = JobParams::new(100, 1024, 1024, 3);
        let plan = BatchPlan::with_batch_size(100, 10);
        let cfg = BatchConfig { max_streams: 8, ..Default::default() };
        let per_stream = 2 * 10 * 2048 * 8;
        let gb = 1usize << 30;
        assert_eq!(stream_count(&params, &plan, &cfg, gb, Some(gb), 8), 8);
        assert_eq!(stream_count(&params, &plan, &cfg, gb, Some(3 * per_stream + 1), 8), 3);
        assert_eq!(stream_count(&params, &plan, &cfg, gb, Some(per_stream - 1), 8), 1);
        assert_eq!(stream_count(&params, &plan, &cfg, gb, Some(0), 8), 1);
    }
}
