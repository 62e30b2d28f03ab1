//! Top-K spectral peak search with sub-bin refinement.
//!
//! This is the exact algorithm of the `peak_search_c32` device kernel:
//! one work-group per lane, every work-item keeps the largest magnitude of
//! its stripe `lid, lid + G, lid + 2G, ...` of the search window, then
//! work-item 0 extracts the top K candidates by repeated max-and-invalidate.
//! Only the strongest peak gets a parabolic sub-bin offset.

use crate::utilities::math_functions::{bin_width_hz, magnitude, parabolic_offset, phase_degrees};
use bytemuck::{Pod, Zeroable};
use num_complex::Complex32;

/// Work-items per lane in the peak-search kernel.
pub const PEAK_GROUP_SIZE: usize = 256;
/// Upper bound on extracted peaks per lane.
pub const MAX_PEAKS: usize = 16;

/// Device-side result record, 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PeakRecord {
    pub index: u32,
    pub real: f32,
    pub imag: f32,
    pub magnitude: f32,
    pub phase: f32,
    pub freq_offset: f32,
    pub refined_frequency: f32,
    pub pad: u32,
}

const _: () = assert!(std::mem::size_of::<PeakRecord>() == 32);

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeakSearch {
    pub transform_size: usize,
    pub search_window: usize,
    pub peak_count: usize,
    pub group_size: usize,
    pub sample_rate_hz: f32,
}

impl PeakSearch {
    #[inline]
    pub fn bin_width_hz(&self) -> f32 {
        bin_width_hz(self.sample_rate_hz, self.transform_size)
    }
}

/// Runs the peak search over one lane's spectrum and fills `out`
/// (`peak_count` records). Slots without a candidate stay zeroed.
pub fn search_peaks(spectrum: &[Complex32], cfg: &PeakSearch, out: &mut [PeakRecord]) {
    let window = cfg.search_window.min(spectrum.len());
    let group = cfg.group_size.max(1);
    let k_max = cfg.peak_count.min(MAX_PEAKS).min(out.len());

    out.iter_mut().for_each(|r| *r = PeakRecord::default());
    if window == 0 {
        return;
    }

    // phase 1: per-work-item stripe maxima
    let mut cand: Vec<(f32, u32)> = Vec::with_capacity(group);
    for lid in 0..group {
        let mut best = -1.0f32;
        let mut best_idx = 0u32;
        let mut i = lid;
        while i < window {
            let m = magnitude(spectrum[i]);
            if m > best {
                best = m;
                best_idx = i as u32;
            }
            i += group;
        }
        cand.push((best, best_idx));
    }

    // phase 2: serial top-K by max-and-invalidate
    let bin_width = cfg.bin_width_hz();
    for k in 0..k_max {
        let mut best = -1.0f32;
        let mut slot = None;
        for (s, &(m, _)) in cand.iter().enumerate() {
            if m > best {
                best = m;
                slot = Some(s);
            }
        }
        let Some(slot) = slot else { break };
        let idx = cand[slot].1;
        for c in cand.iter_mut() {
            if c.1 == idx {
                c.0 = -1.0;
            }
        }

        let z = spectrum[idx as usize];
        let mut rec = PeakRecord {
            index: idx,
            real: z.re,
            imag: z.im,
            magnitude: best,
            phase: phase_degrees(z),
            freq_offset: 0.0,
            refined_frequency: idx as f32 * bin_width,
            pad: 0,
        };
        let i = idx as usize;
        if k == 0 && i > 0 && i + 1 < window {
            let (left, right) = (magnitude(spectrum[i - 1]), magnitude(spectrum[i + 1]));
            let offset = parabolic_offset(left, best, right);
            rec.freq_offset = offset;
            rec.refined_frequency = (idx as f32 + offset) * bin_width;
        }
        out[k] = rec;
    }
}
