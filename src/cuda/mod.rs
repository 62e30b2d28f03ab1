//! CUDA backend (cust-based).
//!
//! The detection helpers are always compiled and report "no device" when the
//! `cuda` feature is off; [`CudaAccelerator`] exists only with the feature.

#[cfg(feature = "cuda")]
pub mod device;

#[cfg(feature = "cuda")]
pub use device::{CudaAccelerator, CudaEvent, CudaKernel, CudaMem, CudaPlan, CudaProgram, CudaQueue};

/// Returns true if a CUDA device is available and the driver API can be initialized.
#[inline]
pub fn cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Returns the number of CUDA devices available (0 on error or when disabled).
#[inline]
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        use cust::{device::Device, prelude::CudaFlags};
        // Never panics when the driver is missing.
        if cust::init(CudaFlags::empty()).is_err() {
            return 0;
        }
        match Device::num_devices() {
            Ok(n) => n as usize,
            Err(_) => 0,
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_never_panics() {
        let n = cuda_device_count();
        assert_eq!(cuda_available(), n > 0);
        #[cfg(not(feature = "cuda"))]
        assert_eq!(n, 0);
    }
}
