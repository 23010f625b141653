//! Memory-mapped output files.
//!
//! [`MmapOutput`] creates a file of a known final size, maps it writable and exposes it as a
//! [`BinaryStreamWriter`]. Since the layout pass computes every segment's size before anything
//! is written, the final file size is always known up front.
//!
//! The file is created directly at the target path. If the output is dropped without
//! [`MmapOutput::finalize`] being called, the incomplete file is removed.
//!
//! ```rust,no_run
//! use peweave::io::{BinaryStreamWriter, MmapOutput};
//!
//! let mut output = MmapOutput::create("output.dll", 4096)?;
//! output.write_bytes(b"MZ")?;
//! output.finalize()?;
//! # Ok::<(), peweave::Error>(())
//! ```

use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use super::writer::BinaryStreamWriter;
use crate::{Error, Result};

/// A fixed-size, memory-mapped output file.
pub struct MmapOutput {
    mmap: MmapMut,
    target_path: PathBuf,
    position: u64,
    finalized: bool,
}

impl MmapOutput {
    /// Creates (or truncates) the file at `target_path`, sizes it to `size` bytes and maps it.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be created, resized or mapped.
    pub fn create<P: AsRef<Path>>(target_path: P, size: u64) -> Result<Self> {
        let target_path = target_path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target_path)?;

        file.set_len(size)?;

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        Ok(MmapOutput {
            mmap,
            target_path,
            position: 0,
            finalized: false,
        })
    }

    /// The mapped contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    /// Size of the file.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// The path the file is written to.
    #[must_use]
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Flushes pending writes to disk.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Flushes the mapping and keeps the file.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the flush fails. The file is removed in that case.
    pub fn finalize(mut self) -> Result<()> {
        self.mmap.flush()?;
        self.finalized = true;
        Ok(())
    }
}

impl BinaryStreamWriter for MmapOutput {
    fn offset(&self) -> u64 {
        self.position
    }

    fn set_offset(&mut self, offset: u64) -> Result<()> {
        if offset > self.size() {
            return Err(Error::AddressOutOfRange(offset));
        }
        self.position = offset;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.size()
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let start =
            usize::try_from(self.position).map_err(|_| Error::AddressOutOfRange(self.position))?;
        let end = start + data.len();

        if end > self.mmap.len() {
            return Err(Error::Error(format!(
                "Write would exceed file size: offset={}, len={}, file_size={}",
                start,
                data.len(),
                self.mmap.len()
            )));
        }

        self.mmap[start..end].copy_from_slice(data);
        self.position = end as u64;
        Ok(())
    }
}

impl Drop for MmapOutput {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.mmap.flush();
            let _ = std::fs::remove_file(&self.target_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_write() {
        let temp_dir = tempdir().unwrap();
        let target_path = temp_dir.path().join("test.bin");

        let mut output = MmapOutput::create(&target_path, 16).unwrap();
        assert_eq!(output.size(), 16);

        output.write_bytes(b"MZ").unwrap();
        output.set_offset(12).unwrap();
        output.write_u32(0x1234_5678).unwrap();
        assert!(output.write_u8(0).is_err());

        output.finalize().unwrap();

        let contents = std::fs::read(&target_path).unwrap();
        assert_eq!(&contents[..2], b"MZ");
        assert_eq!(&contents[12..], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn dropped_without_finalize_is_removed() {
        let temp_dir = tempdir().unwrap();
        let target_path = temp_dir.path().join("incomplete.bin");

        {
            let mut output = MmapOutput::create(&target_path, 8).unwrap();
            output.write_bytes(&[1, 2, 3]).unwrap();
            assert!(target_path.exists());
        }

        assert!(!target_path.exists());
    }

    #[test]
    fn seek_past_end_fails() {
        let temp_dir = tempdir().unwrap();
        let mut output = MmapOutput::create(temp_dir.path().join("seek.bin"), 4).unwrap();
        assert!(output.set_offset(4).is_ok());
        assert!(output.set_offset(5).is_err());
    }
}
