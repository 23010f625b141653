//! Alignment and checked conversion helpers shared by the layout code.

use crate::Result;

/// Converts a `usize` to `u32` for PE serialization, returning an error if the value
/// exceeds `u32::MAX`. Every size field in a PE image is 32 bits wide.
///
/// # Errors
///
/// Returns an error if `value` exceeds `u32::MAX`.
pub fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| malformed_error!("PE serialization value {value} exceeds u32::MAX"))
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An alignment of 0 or 1 leaves the value untouched. Non power-of-two alignments are
/// supported (section alignments in hand-crafted files are not always powers of two).
///
/// ```rust
/// use peweave::utils::align_up;
///
/// assert_eq!(align_up(0x201, 0x200), 0x400);
/// assert_eq!(align_up(0x200, 0x200), 0x200);
/// assert_eq!(align_up(7, 3), 9);
/// ```
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }

    if alignment.is_power_of_two() {
        (value + alignment - 1) & !(alignment - 1)
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// 32-bit flavour of [`align_up`], used for RVAs and header sizes.
#[must_use]
pub fn align_up_u32(value: u32, alignment: u32) -> u32 {
    // Truncation only occurs past 4 GiB, which no valid image reaches.
    #[allow(clippy::cast_possible_truncation)]
    let aligned = align_up(u64::from(value), u64::from(alignment)) as u32;
    aligned
}

/// Checks if a value is a power of two and returns the exponent.
///
/// Returns `Some(n)` if `value == 2^n`, `None` otherwise.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // trailing_zeros <= 63 for u64
pub fn is_power_of_two(value: u64) -> Option<u8> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros() as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_power_of_two() {
        assert_eq!(is_power_of_two(1), Some(0));
        assert_eq!(is_power_of_two(2), Some(1));
        assert_eq!(is_power_of_two(0x200), Some(9));
        assert_eq!(is_power_of_two(0x1000), Some(12));
        assert_eq!(is_power_of_two(0), None);
        assert_eq!(is_power_of_two(6), None);
    }

    #[test]
    fn test_to_u32_valid() {
        assert_eq!(to_u32(0).unwrap(), 0);
        assert_eq!(to_u32(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_to_u32_overflow() {
        assert!(to_u32(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 0x200), 0);
        assert_eq!(align_up(1, 0x200), 0x200);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(5, 0), 5);
        assert_eq!(align_up(5, 1), 5);
        assert_eq!(align_up(10, 6), 12);
        assert_eq!(align_up_u32(0x3FF, 4), 0x400);
    }
}
