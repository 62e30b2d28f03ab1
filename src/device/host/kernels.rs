//! Native implementations of the device kernels for the host backend.

use super::memory::{with_src_dst, HostAllocation};
use crate::device::LaunchDims;
use crate::fft::peaks::{search_peaks, PeakRecord, PeakSearch, PEAK_GROUP_SIZE};
use num_complex::Complex32;
use rayon::prelude::*;
use std::sync::Arc;

pub use crate::fft::{PAD_KERNEL, PEAK_KERNEL};

/// Resolved launch argument.
#[derive(Clone, Debug)]
pub enum HostArg {
    Mem(Arc<HostAllocation>),
    U32(u32),
    F32(f32),
}

impl HostArg {
    pub fn kind(&self) -> &'static str {
        match self {
            HostArg::Mem(_) => "memory",
            HostArg::U32(_) => "u32",
            HostArg::F32(_) => "f32",
        }
    }
}

/// Everything a native kernel sees for one launch.
#[derive(Clone, Debug)]
pub struct HostLaunch {
    pub name: Arc<str>,
    pub args: Vec<HostArg>,
    pub dims: LaunchDims,
}

impl HostLaunch {
    pub fn mem(&self, i: usize) -> Result<&Arc<HostAllocation>, String> {
        match self.args.get(i) {
            Some(HostArg::Mem(m)) => Ok(m),
            other => Err(self.mismatch(i, "memory", other)),
        }
    }

    /// Memory argument the kernel reads.
    pub fn input(&self, i: usize) -> Result<&Arc<HostAllocation>, String> {
        let m = self.mem(i)?;
        m.check_device_read().map_err(|e| format!("{}: argument {i}: {e}", self.name))?;
        Ok(m)
    }

    /// Memory argument the kernel writes.
    pub fn output(&self, i: usize) -> Result<&Arc<HostAllocation>, String> {
        let m = self.mem(i)?;
        m.check_device_write().map_err(|e| format!("{}: argument {i}: {e}", self.name))?;
        Ok(m)
    }

    pub fn u32(&self, i: usize) -> Result<u32, String> {
        match self.args.get(i) {
            Some(HostArg::U32(v)) => Ok(*v),
            other => Err(self.mismatch(i, "u32", other)),
        }
    }

    pub fn f32(&self, i: usize) -> Result<f32, String> {
        match self.args.get(i) {
            Some(HostArg::F32(v)) => Ok(*v),
            other => Err(self.mismatch(i, "f32", other)),
        }
    }

    fn mismatch(&self, i: usize, want: &str, got: Option<&HostArg>) -> String {
        format!("{}: argument {i} must be {want}, got {:?}", self.name, got.map(HostArg::kind))
    }

    pub fn expect_args(&self, n: usize) -> Result<(), String> {
        if self.args.len() == n {
            Ok(())
        } else {
            Err(format!("{}: expected {n} arguments, got {}", self.name, self.args.len()))
        }
    }
}

pub type HostKernelFn = dyn Fn(&HostLaunch) -> Result<(), String> + Send + Sync;

fn check_len(name: &str, what: &str, have: usize, need: usize) -> Result<(), String> {
    if have < need {
        Err(format!("{name}: {what} holds {have} bytes, needs {need}"))
    } else {
        Ok(())
    }
}

/// `pad_lanes_c32(input, output, lanes, samples, transform_size, lane_offset)`
///
/// Copies `samples` points of input lane `lane_offset + l` into slot `l` of
/// the padded output and zero-fills the rest of the slot.
pub fn pad_lanes(launch: &HostLaunch) -> Result<(), String> {
    launch.expect_args(6)?;
    let input = launch.input(0)?;
    let output = launch.output(1)?;
    let lanes = launch.u32(2)? as usize;
    let samples = launch.u32(3)? as usize;
    let tsize = launch.u32(4)? as usize;
    let lane_offset = launch.u32(5)? as usize;
    if tsize == 0 {
        return Err(format!("{}: transform size is zero", launch.name));
    }

    let elem = std::mem::size_of::<Complex32>();
    let need_in = (lane_offset + lanes) * samples * elem;
    let need_out = lanes * tsize * elem;
    check_len(&launch.name, "input", input.len(), need_in)?;
    check_len(&launch.name, "output", output.len(), need_out)?;

    let copy = samples.min(tsize);
    with_src_dst(input, output, |src, dst| -> Result<(), String> {
        let src: &[Complex32] =
            bytemuck::try_cast_slice(&src[..need_in]).map_err(|e| e.to_string())?;
        let dst: &mut [Complex32] =
            bytemuck::try_cast_slice_mut(&mut dst[..need_out]).map_err(|e| e.to_string())?;
        dst.par_chunks_mut(tsize).enumerate().for_each(|(l, slot)| {
            let lane = &src[(lane_offset + l) * samples..][..copy];
            slot[..copy].copy_from_slice(lane);
            slot[copy..].fill(Complex32::new(0.0, 0.0));
        });
        Ok(())
    })?
}

/// `peak_search_c32(spectrum, results, lanes, transform_size, window, peaks,
/// sample_rate, lane_offset)`
///
/// One work-group per lane; results land at record `(lane_offset + l) * peaks`.
pub fn peak_search(launch: &HostLaunch) -> Result<(), String> {
    launch.expect_args(8)?;
    let spectrum = launch.input(0)?;
    let results = launch.output(1)?;
    let lanes = launch.u32(2)? as usize;
    let tsize = launch.u32(3)? as usize;
    let window = launch.u32(4)? as usize;
    let peaks = launch.u32(5)? as usize;
    let sample_rate = launch.f32(6)?;
    let lane_offset = launch.u32(7)? as usize;
    if tsize == 0 || peaks == 0 {
        return Err(format!("{}: transform size and peak count must be positive", launch.name));
    }
    let group = launch.dims.local.unwrap_or(PEAK_GROUP_SIZE);
    if launch.dims.groups() < lanes && launch.dims.local.is_some() {
        let groups = launch.dims.groups();
        return Err(format!("{}: {groups} work-groups for {lanes} lanes", launch.name));
    }

    let rec = std::mem::size_of::<PeakRecord>();
    let need_spec = lanes * tsize * std::mem::size_of::<Complex32>();
    let out_start = lane_offset * peaks * rec;
    let out_end = (lane_offset + lanes) * peaks * rec;
    check_len(&launch.name, "spectrum", spectrum.len(), need_spec)?;
    check_len(&launch.name, "results", results.len(), out_end)?;

    let cfg = PeakSearch {
        transform_size: tsize,
        search_window: window.min(tsize),
        peak_count: peaks,
        group_size: group,
        sample_rate_hz: sample_rate,
    };
    with_src_dst(spectrum, results, |src, dst| -> Result<(), String> {
        let spec: &[Complex32] =
            bytemuck::try_cast_slice(&src[..need_spec]).map_err(|e| e.to_string())?;
        let out: &mut [PeakRecord] =
            bytemuck::try_cast_slice_mut(&mut dst[out_start..out_end]).map_err(|e| e.to_string())?;
        out.par_chunks_mut(peaks)
            .zip(spec.par_chunks(tsize))
            .for_each(|(records, lane)| search_peaks(lane, &cfg, records));
        Ok(())
    })?
}

pub(crate) fn builtin_kernels() -> Vec<(&'static str, Arc<HostKernelFn>)> {
    vec![
        (PAD_KERNEL, Arc::new(pad_lanes) as Arc<HostKernelFn>),
        (PEAK_KERNEL, Arc::new(peak_search) as Arc<HostKernelFn>),
    ]
}

/// Program text the host backend "compiles": PTX-style entry declarations
/// that resolve against the native kernel registry.
pub(crate) const HOST_LANE_FFT_SOURCE: &str = "\
// radar_compute lane FFT kernels (host backend)
.version 1.0
.target host
.visible .entry pad_lanes_c32(
    .param .u64 input, .param .u64 output, .param .u32 lanes,
    .param .u32 samples, .param .u32 transform_size, .param .u32 lane_offset)
.visible .entry peak_search_c32(
    .param .u64 spectrum, .param .u64 results, .param .u32 lanes,
    .param .u32 transform_size, .param .u32 window, .param .u32 peaks,
    .param .f32 sample_rate, .param .u32 lane_offset)
";

/// Entry-point names declared in `source` (`.entry <name>`), in order.
pub(crate) fn parse_entries(source: &str) -> Vec<(usize, String)> {
    source
        .lines()
        .enumerate()
        .filter_map(|(lineno, raw)| {
            let line = raw.split("//").next().unwrap_or("").trim();
            let pos = line.find(".entry")?;
            let rest = line[pos + ".entry".len()..].trim_start();
            let name: String =
                rest.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
            Some((lineno + 1, name))
        })
        .collect()
}
