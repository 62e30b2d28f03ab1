use super::memory::{with_src_dst, HostAllocation};
use crate::device::{TransformDesc, TransformLayout};
use crate::error::{ComputeError, Result};
use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// Fixed-batch forward transform plan.
#[derive(Clone)]
pub struct HostPlan {
    pub(crate) length: usize,
    pub(crate) batch: usize,
    pub(crate) layout: TransformLayout,
    fft: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for HostPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPlan")
            .field("length", &self.length)
            .field("batch", &self.batch)
            .field("layout", &self.layout)
            .finish()
    }
}

impl HostPlan {
    pub(crate) fn new(desc: &TransformDesc) -> Result<Self> {
        if desc.length == 0 || desc.batch == 0 {
            return Err(ComputeError::InvalidInput(format!(
                "transform plan needs positive length and batch (got {} x {})",
                desc.length, desc.batch
            )));
        }
        if desc.hooks.is_some() {
            let msg = "host transform plans do not take callback hooks";
            return Err(ComputeError::Unsupported(msg.into()));
        }
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(desc.length);
        Ok(Self { length: desc.length, batch: desc.batch, layout: desc.layout, fft })
    }

    #[inline]
    pub(crate) fn bytes(&self) -> usize {
        self.length * self.batch * std::mem::size_of::<Complex32>()
    }

    /// Checks buffer sizes against the plan before anything is enqueued.
    pub(crate) fn check_buffers(
        &self,
        input: &HostAllocation,
        output: &HostAllocation,
    ) -> Result<()> {
        let need = self.bytes();
        for alloc in [input, output] {
            if alloc.len() < need {
                return Err(ComputeError::Capacity { requested: need, capacity: alloc.len() });
            }
        }
        input.check_device_read().map_err(ComputeError::InvalidInput)?;
        output.check_device_write().map_err(ComputeError::InvalidInput)?;
        match self.layout {
            TransformLayout::InPlace if input.id != output.id => Err(ComputeError::InvalidInput(
                "in-place plan executed with distinct input and output".into(),
            )),
            TransformLayout::OutOfPlace if input.id == output.id => Err(ComputeError::InvalidInput(
                "out-of-place plan executed with aliased input and output".into(),
            )),
            _ => Ok(()),
        }
    }

    fn transform_lanes(&self, data: &mut [u8]) -> std::result::Result<(), String> {
        let lanes: &mut [Complex32] =
            bytemuck::try_cast_slice_mut(&mut data[..self.bytes()]).map_err(|e| e.to_string())?;
        let fft = &self.fft;
        lanes.par_chunks_mut(self.length).for_each(|lane| fft.process(lane));
        Ok(())
    }

    /// Body of the enqueued command.
    pub(crate) fn execute(
        &self,
        input: &HostAllocation,
        output: &HostAllocation,
    ) -> std::result::Result<(), String> {
        let need = self.bytes();
        if input.id == output.id {
            let mut data = output.write();
            return self.transform_lanes(&mut data[..]);
        }
        with_src_dst(input, output, |src, dst| {
            dst[..need].copy_from_slice(&src[..need]);
            self.transform_lanes(dst)
        })?
    }
}
