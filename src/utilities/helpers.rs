use crate::error::{ComputeError, Result};
use std::str::FromStr;
use std::sync::OnceLock;

static HOST_PARALLELISM: OnceLock<usize> = OnceLock::new();

/// Hardware concurrency of the host, at least 1.
#[inline(always)]
pub fn detect_parallelism() -> usize {
    *HOST_PARALLELISM.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1)
    })
}

#[inline]
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Smallest power of two >= `n` (1 for n == 0).
#[inline]
pub fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Padded transform length for a lane of `samples` points.
#[inline]
pub fn transform_size(samples: usize, oversampling: usize) -> usize {
    next_power_of_two(samples).saturating_mul(oversampling.max(1))
}

/// `count * size_of::<T>()`, failing instead of wrapping.
#[inline]
pub fn bytes_for<T>(count: usize) -> Result<usize> {
    count.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
        ComputeError::InvalidInput(format!("byte size overflow for {count} elements"))
    })
}

#[inline]
pub fn div_ceil(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Reads an env knob and parses it; unset or unparsable values yield `None`.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// "1", "true", "yes" and "on" count as enabled.
pub fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pow2_edges() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(1000), 1024);
        assert_eq!(next_power_of_two(1024), 1024);
        assert_eq!(next_power_of_two(1025), 2048);
    }

    #[test]
    fn transform_size_oversamples() {
        assert_eq!(transform_size(1024, 2), 2048);
        assert_eq!(transform_size(1000, 2), 2048);
        assert_eq!(transform_size(1000, 1), 1024);
        assert_eq!(transform_size(3, 4), 16);
    }

    #[test]
    fn bytes_for_overflow_is_error() {
        assert_eq!(bytes_for::<u64>(3).unwrap(), 24);
        assert!(bytes_for::<u64>(usize::MAX).is_err());
    }

    #[test]
    fn div_ceil_rounds_up() {
        assert_eq!(div_ceil(130, 64), 3);
        assert_eq!(div_ceil(128, 64), 2);
        assert_eq!(div_ceil(5, 0), 0);
    }

    #[test]
    fn parallelism_is_positive() {
        assert!(detect_parallelism() >= 1);
    }
}
