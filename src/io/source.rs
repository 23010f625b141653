//! The randomly addressable byte space every reader is built on.
//!
//! A [`DataSource`] is read-only and addressed by absolute addresses in the range
//! `[base_address, base_address + length)`. The concrete variants cover in-memory buffers
//! ([`crate::io::ByteArrayDataSource`]), memory-mapped files ([`crate::io::MemoryMappedDataSource`]),
//! generic seekable streams ([`crate::io::StreamDataSource`]), raw pointers
//! ([`crate::io::UnmanagedDataSource`]) and three adaptors defined here:
//!
//! - [`ZeroesDataSource`] - every valid address reads as zero (padding regions)
//! - [`DisplacedDataSource`] - shifts the address space of another source
//! - [`DataSourceSlice`] - a bounded window over another source
//!
//! Adaptors never serve addresses outside their declared window, even when the backing
//! source would.

use std::sync::Arc;

use crate::{Error, Result};

/// A shared handle to a data source. Readers fork by cloning this handle.
pub type DataSourceRef = Arc<dyn DataSource>;

/// Read-only, randomly addressable byte space.
pub trait DataSource: Send + Sync {
    /// The first valid address of this source.
    fn base_address(&self) -> u64 {
        0
    }

    /// Number of addressable bytes.
    fn length(&self) -> u64;

    /// Checks whether `address` can be read from.
    fn is_valid_address(&self, address: u64) -> bool {
        let base = self.base_address();
        address >= base && address - base < self.length()
    }

    /// Copies bytes starting at `address` into `buffer`.
    ///
    /// Reads are best-effort: when the end of the source is reached before the buffer is full,
    /// the number of bytes actually copied is returned.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if `address` itself is not a valid address.
    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Returns the whole source as a contiguous slice, when the backing storage allows it.
    fn as_slice(&self) -> Option<&[u8]> {
        None
    }
}

/// Clamps a read of `requested` bytes at `address` to the window `[base, base + length)`.
pub(crate) fn available_in_window(base: u64, length: u64, address: u64, requested: usize) -> usize {
    let end = base.saturating_add(length);
    let available = end.saturating_sub(address);
    usize::try_from(available).map_or(requested, |available| available.min(requested))
}

/// A data source where every valid address reads as zero.
#[derive(Debug, Clone, Copy)]
pub struct ZeroesDataSource {
    base_address: u64,
    length: u64,
}

impl ZeroesDataSource {
    /// Creates a zero-filled source of `length` bytes starting at address 0.
    #[must_use]
    pub fn new(length: u64) -> Self {
        Self::with_base(0, length)
    }

    /// Creates a zero-filled source of `length` bytes starting at `base_address`.
    #[must_use]
    pub fn with_base(base_address: u64, length: u64) -> Self {
        ZeroesDataSource {
            base_address,
            length,
        }
    }
}

impl DataSource for ZeroesDataSource {
    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(self.base_address, self.length, address, buffer.len());
        buffer[..count].fill(0);
        Ok(count)
    }
}

/// Shifts the address space of another source by a fixed displacement.
///
/// Address `a` of the displaced source maps onto address `a - displacement` of the backing
/// source. Used to expose a file-offset based source in RVA coordinates and vice versa.
pub struct DisplacedDataSource {
    source: DataSourceRef,
    displacement: i64,
}

impl DisplacedDataSource {
    /// Wraps `source`, shifting every address by `displacement`.
    #[must_use]
    pub fn new(source: DataSourceRef, displacement: i64) -> Self {
        DisplacedDataSource {
            source,
            displacement,
        }
    }

    /// The displacement applied to the backing source.
    #[must_use]
    pub fn displacement(&self) -> i64 {
        self.displacement
    }

    fn to_backing(&self, address: u64) -> Option<u64> {
        address.checked_add_signed(self.displacement.checked_neg()?)
    }
}

impl DataSource for DisplacedDataSource {
    fn base_address(&self) -> u64 {
        self.source
            .base_address()
            .checked_add_signed(self.displacement)
            .unwrap_or(0)
    }

    fn length(&self) -> u64 {
        self.source.length()
    }

    fn is_valid_address(&self, address: u64) -> bool {
        self.to_backing(address)
            .is_some_and(|backing| self.source.is_valid_address(backing))
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        let Some(backing) = self.to_backing(address) else {
            return Err(Error::AddressOutOfRange(address));
        };

        if !self.source.is_valid_address(backing) {
            return Err(Error::AddressOutOfRange(address));
        }

        self.source.read_bytes(backing, buffer)
    }
}

/// A bounded window `[start, start + length)` over another source, in the same address space.
pub struct DataSourceSlice {
    source: DataSourceRef,
    start: u64,
    length: u64,
}

impl DataSourceSlice {
    /// Creates a window over `source`.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if the window is not fully covered by `source`.
    pub fn new(source: DataSourceRef, start: u64, length: u64) -> Result<Self> {
        if length > 0 {
            let last = start
                .checked_add(length - 1)
                .ok_or(Error::AddressOutOfRange(start))?;

            if !source.is_valid_address(start) {
                return Err(Error::AddressOutOfRange(start));
            }
            if !source.is_valid_address(last) {
                return Err(Error::AddressOutOfRange(last));
            }
        }

        Ok(DataSourceSlice {
            source,
            start,
            length,
        })
    }
}

impl DataSource for DataSourceSlice {
    fn base_address(&self) -> u64 {
        self.start
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(self.start, self.length, address, buffer.len());
        self.source.read_bytes(address, &mut buffer[..count])
    }

    fn as_slice(&self) -> Option<&[u8]> {
        let full = self.source.as_slice()?;
        let start = usize::try_from(self.start - self.source.base_address()).ok()?;
        let end = start.checked_add(usize::try_from(self.length).ok()?)?;
        full.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ByteArrayDataSource;

    fn sample() -> DataSourceRef {
        Arc::new(ByteArrayDataSource::new((0u8..32).collect()))
    }

    #[test]
    fn zeroes() {
        let zeroes = ZeroesDataSource::with_base(0x100, 8);
        let mut buffer = [0xFF; 16];

        assert_eq!(zeroes.read_bytes(0x104, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], &[0, 0, 0, 0]);
        assert_eq!(buffer[4], 0xFF);
        assert!(zeroes.read_bytes(0xFF, &mut buffer).is_err());
        assert!(zeroes.read_bytes(0x108, &mut buffer).is_err());
    }

    #[test]
    fn displaced() {
        let displaced = DisplacedDataSource::new(sample(), 0x1000);

        assert_eq!(displaced.base_address(), 0x1000);
        assert!(displaced.is_valid_address(0x1000));
        assert!(!displaced.is_valid_address(0x0FFF));
        assert!(!displaced.is_valid_address(0x1020));

        let mut buffer = [0; 2];
        displaced.read_bytes(0x1004, &mut buffer).unwrap();
        assert_eq!(buffer, [4, 5]);
        assert!(displaced.read_bytes(4, &mut buffer).is_err());
    }

    #[test]
    fn slice_rejects_outside_window() {
        let slice = DataSourceSlice::new(sample(), 8, 4).unwrap();
        let mut buffer = [0; 8];

        assert_eq!(slice.read_bytes(8, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], &[8, 9, 10, 11]);

        // The backing source serves address 12, the slice must not.
        assert!(slice.read_bytes(12, &mut buffer).is_err());
        assert!(slice.read_bytes(7, &mut buffer).is_err());
        assert_eq!(slice.as_slice().unwrap(), &[8, 9, 10, 11]);
    }

    #[test]
    fn slice_must_fit_source() {
        assert!(DataSourceSlice::new(sample(), 30, 4).is_err());
        assert!(DataSourceSlice::new(sample(), 40, 0).is_ok());
        assert!(DataSourceSlice::new(sample(), u64::MAX, 2).is_err());
    }
}
