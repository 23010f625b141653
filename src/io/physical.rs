//! Memory-mapped file data source.
//!
//! Mapping a file is `unsafe` with `memmap2`, as another process may truncate or modify the
//! file while it is mapped. The mapping is opened read-only and kept alive for as long as any
//! reader forked over it exists.

use memmap2::Mmap;
use std::{fs, path::Path};

use super::source::{available_in_window, DataSource};
use crate::{
    Error::{self, FileError},
    Result,
};

/// A data source backed by a read-only memory mapping of a file.
#[derive(Debug)]
pub struct MemoryMappedDataSource {
    data: Mmap,
}

impl MemoryMappedDataSource {
    /// Maps the file at `path` into memory.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<MemoryMappedDataSource> {
        let file = fs::File::open(path).map_err(FileError)?;
        Self::from_std_file(&file)
    }

    /// Maps an already opened file into memory.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be mapped.
    pub fn from_std_file(file: &fs::File) -> Result<MemoryMappedDataSource> {
        let mmap = unsafe { Mmap::map(file) }.map_err(FileError)?;
        Ok(MemoryMappedDataSource { data: mmap })
    }
}

impl DataSource for MemoryMappedDataSource {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let count = available_in_window(0, self.length(), address, buffer.len());
        let start = usize::try_from(address).map_err(|_| Error::AddressOutOfRange(address))?;

        buffer[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn as_slice(&self) -> Option<&[u8]> {
        Some(self.data.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn physical() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x4D, 0x5A, 0x90, 0x00, 0x03]).unwrap();
        file.flush().unwrap();

        let physical = MemoryMappedDataSource::new(file.path()).unwrap();
        assert_eq!(physical.length(), 5);

        let mut buffer = [0u8; 2];
        physical.read_bytes(0, &mut buffer).unwrap();
        assert_eq!(buffer, [0x4D, 0x5A]);

        assert!(physical.read_bytes(5, &mut buffer).is_err());
        assert_eq!(physical.read_bytes(4, &mut buffer).unwrap(), 1);
    }

    #[test]
    fn invalid_file_path() {
        let result = MemoryMappedDataSource::new(PathBuf::from("/nonexistent/path/to/file.dll"));
        match result {
            Err(FileError(io_error)) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected FileError"),
        }
    }
}
