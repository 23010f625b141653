//! In-memory data source backed by an owned byte buffer.

use std::sync::Arc;

use super::source::{available_in_window, DataSource};
use crate::{Error, Result};

/// A data source backed by an in-memory buffer.
///
/// The buffer is reference counted, so cloning the source (or forking readers over it) never
/// copies the underlying bytes.
#[derive(Debug, Clone)]
pub struct ByteArrayDataSource {
    data: Arc<[u8]>,
    base_address: u64,
}

impl ByteArrayDataSource {
    /// Wraps `data`, addressing it from 0.
    #[must_use]
    pub fn new(data: Vec<u8>) -> ByteArrayDataSource {
        ByteArrayDataSource {
            data: data.into(),
            base_address: 0,
        }
    }

    /// Wraps `data`, addressing its first byte as `base_address`.
    #[must_use]
    pub fn with_base(data: Vec<u8>, base_address: u64) -> ByteArrayDataSource {
        ByteArrayDataSource {
            data: data.into(),
            base_address,
        }
    }

    /// Wraps an already shared buffer without copying it.
    #[must_use]
    pub fn from_shared(data: Arc<[u8]>, base_address: u64) -> ByteArrayDataSource {
        ByteArrayDataSource { data, base_address }
    }

    /// The raw backing buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl DataSource for ByteArrayDataSource {
    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(self.base_address, self.length(), address, buffer.len());
        let start = usize::try_from(address - self.base_address)
            .map_err(|_| Error::AddressOutOfRange(address))?;

        buffer[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn as_slice(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory() {
        let mut data = vec![0xCC_u8; 1048];
        data[10..15].fill(0xBB);

        let memory = ByteArrayDataSource::new(data);
        assert_eq!(memory.length(), 1048);

        let mut buffer = [0u8; 5];
        assert_eq!(memory.read_bytes(10, &mut buffer).unwrap(), 5);
        assert_eq!(buffer, [0xBB; 5]);

        assert!(memory.read_bytes(u64::from(u32::MAX), &mut buffer).is_err());
        assert!(memory.read_bytes(1048, &mut buffer).is_err());
    }

    #[test]
    fn short_read_at_end() {
        let memory = ByteArrayDataSource::new(vec![1, 2, 3]);
        let mut buffer = [0u8; 8];

        assert_eq!(memory.read_bytes(1, &mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], &[2, 3]);
    }

    #[test]
    fn empty_buffer() {
        let memory = ByteArrayDataSource::new(vec![]);
        let mut buffer = [0u8; 1];

        assert_eq!(memory.length(), 0);
        assert!(!memory.is_valid_address(0));
        assert!(memory.read_bytes(0, &mut buffer).is_err());
    }

    #[test]
    fn based() {
        let memory = ByteArrayDataSource::with_base(vec![1, 2, 3, 4], 0x400000);
        let mut buffer = [0u8; 2];

        assert!(!memory.is_valid_address(0));
        assert!(memory.is_valid_address(0x400003));
        memory.read_bytes(0x400002, &mut buffer).unwrap();
        assert_eq!(buffer, [3, 4]);
    }
}
