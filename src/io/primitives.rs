//! Fixed-width little-endian primitives.
//!
//! [`Primitive`] is the unified interface the reader and writer use for every fixed-size value.
//! PE and CLI structures are little-endian throughout, so only little-endian conversions are
//! provided.

/// A fixed-width value that can be converted from and to little-endian bytes.
pub trait Primitive: Sized + Copy {
    /// Number of bytes of the encoding.
    const SIZE: usize;

    /// Decodes a value from the first [`Primitive::SIZE`] bytes of `bytes`.
    ///
    /// # Panics
    /// Callers guarantee `bytes.len() >= Self::SIZE`.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encodes the value into the first [`Primitive::SIZE`] bytes of `out`.
    fn write_le_slice(self, out: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le_slice(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Reads a little-endian value from the start of `data`, if long enough.
#[must_use]
pub fn read_le<T: Primitive>(data: &[u8]) -> Option<T> {
    (data.len() >= T::SIZE).then(|| T::from_le_slice(data))
}

/// Reads a little-endian value at `*offset`, advancing the offset on success.
#[must_use]
pub fn read_le_at<T: Primitive>(data: &[u8], offset: &mut usize) -> Option<T> {
    let value = read_le::<T>(data.get(*offset..)?)?;
    *offset += T::SIZE;
    Some(value)
}

/// Overwrites a little-endian value at `offset`. Returns `false` when `data` is too short.
pub fn write_le_at<T: Primitive>(data: &mut [u8], offset: usize, value: T) -> bool {
    match offset
        .checked_add(T::SIZE)
        .and_then(|end| data.get_mut(offset..end))
    {
        Some(target) => {
            value.write_le_slice(target);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_values() {
        assert_eq!(read_le::<u8>(&TEST_BUFFER), Some(0x01));
        assert_eq!(read_le::<u16>(&TEST_BUFFER), Some(0x0201));
        assert_eq!(read_le::<u32>(&TEST_BUFFER), Some(0x0403_0201));
        assert_eq!(read_le::<u64>(&TEST_BUFFER), Some(0x0807_0605_0403_0201));
        assert_eq!(read_le::<i16>(&[0xFE, 0xFF]), Some(-2));
        assert_eq!(read_le::<f32>(&1.5f32.to_le_bytes()), Some(1.5));
    }

    #[test]
    fn read_too_short() {
        assert_eq!(read_le::<u32>(&TEST_BUFFER[..3]), None);
        assert_eq!(read_le::<u64>(&[]), None);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&TEST_BUFFER, &mut offset), Some(0x0201));
        assert_eq!(read_le_at::<u32>(&TEST_BUFFER, &mut offset), Some(0x0605_0403));
        assert_eq!(offset, 6);
        assert_eq!(read_le_at::<u32>(&TEST_BUFFER, &mut offset), None);
        assert_eq!(offset, 6);
    }

    #[test]
    fn write_le_at_bounds() {
        let mut data = [0u8; 6];
        assert!(write_le_at(&mut data, 2, 0xAABB_CCDDu32));
        assert_eq!(data, [0, 0, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert!(!write_le_at(&mut data, 4, 0u32));
        assert!(!write_le_at(&mut data, usize::MAX, 0u16));
    }
}
