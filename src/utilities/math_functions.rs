use num_complex::Complex32;

pub const RAD_TO_DEG: f32 = 57.295_779_513;

/// Curvatures smaller than this are treated as flat.
pub const PARABOLA_EPS: f32 = 1e-10;

#[inline(always)]
pub fn magnitude(z: Complex32) -> f32 {
    (z.re * z.re + z.im * z.im).sqrt()
}

#[inline(always)]
pub fn phase_degrees(z: Complex32) -> f32 {
    z.im.atan2(z.re) * RAD_TO_DEG
}

/// Vertex offset of the parabola through (-1, left), (0, center), (1, right),
/// clamped to [-0.5, 0.5]. Returns 0 when the curvature is near zero.
#[inline]
pub fn parabolic_offset(left: f32, center: f32, right: f32) -> f32 {
    let denom = left - 2.0 * center + right;
    if denom.abs() > PARABOLA_EPS {
        (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    }
}

#[inline(always)]
pub fn bin_width_hz(sample_rate_hz: f32, transform_size: usize) -> f32 {
    sample_rate_hz / transform_size as f32
}
