//! Alignment helpers for pitched allocations.

/// Align a size up to the given power-of-two alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round up to the next even number.
#[inline]
pub const fn round_up_2(value: u32) -> u32 {
    (value + 1) & !1
}

/// Divide rounding up, for subsampled plane extents.
#[inline]
pub const fn div_ceil_shift(value: u32, shift: u32) -> u32 {
    (value + (1 << shift) - 1) >> shift
}
