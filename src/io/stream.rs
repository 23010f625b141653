//! Data sources over seekable OS streams and raw memory.

use std::{
    io::{Read, Seek, SeekFrom},
    sync::Mutex,
};

use super::source::{available_in_window, DataSource};
use crate::{Error, Result};

/// A data source that reads on demand from a seekable stream.
///
/// Every read seeks the stream first; the stream is guarded by a mutex so forked readers can
/// share the source across threads.
pub struct StreamDataSource<S> {
    stream: Mutex<S>,
    length: u64,
}

impl<S: Read + Seek + Send> StreamDataSource<S> {
    /// Wraps `stream`, measuring its length by seeking to the end.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if seeking fails.
    pub fn new(mut stream: S) -> Result<Self> {
        let length = stream.seek(SeekFrom::End(0))?;
        Ok(StreamDataSource {
            stream: Mutex::new(stream),
            length,
        })
    }
}

impl<S: Read + Seek + Send> DataSource for StreamDataSource<S> {
    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(0, self.length, address, buffer.len());
        let mut stream = lock!(self.stream);
        stream.seek(SeekFrom::Start(address))?;

        let mut total = 0;
        while total < count {
            let read = stream.read(&mut buffer[total..count])?;
            if read == 0 {
                break;
            }
            total += read;
        }

        Ok(total)
    }
}

/// A data source over a raw, externally owned memory region.
///
/// Used to inspect images that are already mapped into the current process.
pub struct UnmanagedDataSource {
    base: *const u8,
    length: u64,
}

// The region is never written through this type, and the creator guarantees it outlives the
// source.
unsafe impl Send for UnmanagedDataSource {}
unsafe impl Sync for UnmanagedDataSource {}

impl UnmanagedDataSource {
    /// Creates a source over `length` bytes starting at `base`.
    ///
    /// # Safety
    /// `base` must point to at least `length` readable bytes that stay valid and unmodified for
    /// the lifetime of the returned source and every reader created over it.
    #[must_use]
    pub unsafe fn new(base: *const u8, length: u64) -> Self {
        UnmanagedDataSource { base, length }
    }
}

impl DataSource for UnmanagedDataSource {
    fn base_address(&self) -> u64 {
        self.base as u64
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(self.base_address(), self.length, address, buffer.len());
        let relative =
            usize::try_from(address - self.base_address()).map_err(|_| Error::AddressOutOfRange(address))?;

        // Bounds were validated against the region handed to `new`.
        let source = unsafe { std::slice::from_raw_parts(self.base.add(relative), count) };
        buffer[..count].copy_from_slice(source);
        Ok(count)
    }

    fn as_slice(&self) -> Option<&[u8]> {
        let length = usize::try_from(self.length).ok()?;
        Some(unsafe { std::slice::from_raw_parts(self.base, length) })
    }
}
