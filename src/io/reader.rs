//! Bounded, address-space aware cursor over a [`DataSource`].
//!
//! A [`BinaryStreamReader`] is a cheap value: a shared handle to its source plus five integers
//! (`start_offset`, `start_rva`, `length`, current `offset`). Cloning it (see
//! [`BinaryStreamReader::fork`]) never copies bytes, which is what makes the deferred parsing
//! pattern of the object model affordable: structures read their fixed-size header eagerly,
//! capture forked readers over their variable-length tails, and only parse those when needed.
//!
//! # Coordinates
//!
//! - `offset` is the absolute address in the data source (a file offset for unmapped files)
//! - `relative_offset = offset - start_offset`
//! - `rva = start_rva + relative_offset`
//!
//! # Bounds
//!
//! Constructing a reader over a window that the source does not fully cover fails immediately.
//! Every fixed-width read checks [`BinaryStreamReader::can_read`] before touching the cursor,
//! so a failing read never leaves the reader partially advanced.
//!
//! # Example
//!
//! ```rust
//! use peweave::io::BinaryStreamReader;
//!
//! let mut reader = BinaryStreamReader::from_bytes(vec![0x4D, 0x5A, 0x90, 0x00]);
//! assert_eq!(reader.read_u16()?, 0x5A4D);
//! assert!(!reader.can_read(4));
//! assert!(reader.read_u32().is_err());
//! assert_eq!(reader.relative_offset(), 2);
//! # Ok::<(), peweave::Error>(())
//! ```

use std::sync::Arc;

use widestring::U16String;

use super::{
    memory::ByteArrayDataSource,
    primitives::Primitive,
    source::{DataSource, DataSourceRef},
    writer::BinaryStreamWriter,
};
use crate::{segment::DataSegment, Error, Result};

/// Chunk size used by [`BinaryStreamReader::write_to_output`].
const COPY_CHUNK_SIZE: usize = 4096;

/// A bounded cursor over a data source. See the module documentation.
#[derive(Clone)]
pub struct BinaryStreamReader {
    source: DataSourceRef,
    start_offset: u64,
    start_rva: u32,
    length: u32,
    offset: u64,
}

impl std::fmt::Debug for BinaryStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryStreamReader")
            .field("start_offset", &format_args!("0x{:08X}", self.start_offset))
            .field("start_rva", &format_args!("0x{:08X}", self.start_rva))
            .field("length", &self.length)
            .field("offset", &format_args!("0x{:08X}", self.offset))
            .finish()
    }
}

impl BinaryStreamReader {
    /// Creates a reader over `[offset, offset + length)` of `source`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if `length > 0` and either end of the window is not a valid
    /// address of the source.
    pub fn new(source: DataSourceRef, offset: u64, rva: u32, length: u32) -> Result<Self> {
        if length > 0 {
            let last = offset.checked_add(u64::from(length) - 1);
            let valid = source.is_valid_address(offset)
                && last.is_some_and(|last| source.is_valid_address(last));

            if !valid {
                return Err(Error::EndOfStream {
                    relative_offset: 0,
                    requested: u64::from(length),
                    length: source.length(),
                });
            }
        }

        Ok(BinaryStreamReader {
            source,
            start_offset: offset,
            start_rva: rva,
            length,
            offset,
        })
    }

    /// Creates a reader spanning an entire in-memory buffer.
    ///
    /// Buffers larger than 4 GiB are truncated to a 4 GiB window.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let length = u32::try_from(data.len()).unwrap_or(u32::MAX);
        BinaryStreamReader {
            source: Arc::new(ByteArrayDataSource::new(data)),
            start_offset: 0,
            start_rva: 0,
            length,
            offset: 0,
        }
    }

    /// Creates a reader spanning an entire data source.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if the source is larger than 4 GiB.
    pub fn from_source(source: DataSourceRef) -> Result<Self> {
        let length = u32::try_from(source.length())
            .map_err(|_| Error::AddressOutOfRange(source.length()))?;
        let base = source.base_address();
        Self::new(source, base, 0, length)
    }

    /// The data source this reader reads from.
    #[must_use]
    pub fn source(&self) -> &DataSourceRef {
        &self.source
    }

    /// Absolute address of the first byte of the window.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// RVA of the first byte of the window.
    #[must_use]
    pub fn start_rva(&self) -> u32 {
        self.start_rva
    }

    /// Number of bytes in the window.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Absolute address of the end of the window (exclusive).
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.start_offset + u64::from(self.length)
    }

    /// Current absolute address.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Moves the cursor to an absolute address inside (or at the end of) the window.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if `offset` lies outside the window.
    pub fn set_offset(&mut self, offset: u64) -> Result<()> {
        if offset < self.start_offset || offset > self.end_offset() {
            return Err(Error::AddressOutOfRange(offset));
        }

        self.offset = offset;
        Ok(())
    }

    /// Current position relative to the start of the window.
    #[must_use]
    pub fn relative_offset(&self) -> u64 {
        self.offset - self.start_offset
    }

    /// Moves the cursor relative to the start of the window.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if the position lies outside the window.
    pub fn set_relative_offset(&mut self, relative_offset: u64) -> Result<()> {
        let offset = self
            .start_offset
            .checked_add(relative_offset)
            .ok_or(Error::AddressOutOfRange(relative_offset))?;
        self.set_offset(offset)
    }

    /// RVA of the current position.
    #[must_use]
    pub fn rva(&self) -> u32 {
        // Windows are at most 4 GiB, so the relative offset fits.
        #[allow(clippy::cast_possible_truncation)]
        let relative = self.relative_offset() as u32;
        self.start_rva.wrapping_add(relative)
    }

    /// Moves the cursor to an RVA inside the window.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if the RVA lies outside the window.
    pub fn set_rva(&mut self, rva: u32) -> Result<()> {
        let relative = rva
            .checked_sub(self.start_rva)
            .ok_or(Error::AddressOutOfRange(u64::from(rva)))?;
        self.set_relative_offset(u64::from(relative))
    }

    /// Number of bytes left in the window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let remaining = (self.end_offset() - self.offset) as u32;
        remaining
    }

    /// Checks whether `count` more bytes can be read.
    #[must_use]
    pub fn can_read(&self, count: u32) -> bool {
        self.relative_offset() + u64::from(count) <= u64::from(self.length)
    }

    /// Creates an independent copy of this reader at the same position.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Creates a reader starting at an absolute address of the same source, spanning the
    /// remainder of this reader's window.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if `offset` lies outside the window.
    pub fn fork_absolute(&self, offset: u64) -> Result<Self> {
        if offset < self.start_offset || offset > self.end_offset() {
            return Err(Error::AddressOutOfRange(offset));
        }

        #[allow(clippy::cast_possible_truncation)]
        let size = (self.end_offset() - offset) as u32;
        self.fork_absolute_sized(offset, size)
    }

    /// Creates a reader over `[offset, offset + size)` of the same source.
    ///
    /// The RVA of the new reader is derived from this reader's coordinates:
    /// `new_rva = start_rva + (offset - start_offset)`.
    ///
    /// # Errors
    /// Returns an error if `offset` precedes this window or the new window is not covered by
    /// the source.
    pub fn fork_absolute_sized(&self, offset: u64, size: u32) -> Result<Self> {
        let delta = offset
            .checked_sub(self.start_offset)
            .ok_or(Error::AddressOutOfRange(offset))?;

        #[allow(clippy::cast_possible_truncation)]
        let rva = self.start_rva.wrapping_add(delta as u32);
        BinaryStreamReader::new(self.source.clone(), offset, rva, size)
    }

    /// Creates a reader starting at a position relative to this window's start, spanning the
    /// remainder of the window.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if the position lies outside the window.
    pub fn fork_relative(&self, relative_offset: u64) -> Result<Self> {
        self.fork_absolute(self.start_offset + relative_offset)
    }

    /// Creates a reader over `size` bytes at a position relative to this window's start.
    ///
    /// # Errors
    /// Returns an error if the new window is not covered by the source.
    pub fn fork_relative_sized(&self, relative_offset: u64, size: u32) -> Result<Self> {
        self.fork_absolute_sized(self.start_offset + relative_offset, size)
    }

    /// Resizes the window.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the source does not cover the new window.
    pub fn change_size(&mut self, new_size: u32) -> Result<()> {
        let resized =
            BinaryStreamReader::new(self.source.clone(), self.start_offset, self.start_rva, new_size)?;
        self.length = resized.length;
        self.offset = self.offset.min(self.end_offset());
        Ok(())
    }

    /// Advances the cursor to the next multiple of `alignment` relative to the source's address
    /// space, clamped to the end of the window.
    pub fn align(&mut self, alignment: u32) {
        let aligned = crate::utils::align_up(self.offset, u64::from(alignment));
        self.offset = aligned.min(self.end_offset());
    }

    /// Skips `count` bytes.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if fewer than `count` bytes remain.
    pub fn skip(&mut self, count: u32) -> Result<()> {
        ensure_can_read!(self, count);
        self.offset += u64::from(count);
        Ok(())
    }

    /// Reads a fixed-width little-endian value.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] without advancing if the window is too short.
    pub fn read<T: Primitive>(&mut self) -> Result<T> {
        let value = self.peek::<T>()?;
        self.offset += T::SIZE as u64;
        Ok(value)
    }

    /// Reads a fixed-width little-endian value without advancing.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn peek<T: Primitive>(&self) -> Result<T> {
        #[allow(clippy::cast_possible_truncation)]
        let size = T::SIZE as u32;
        ensure_can_read!(self, size);

        let mut raw = [0u8; 8];
        let count = self.source.read_bytes(self.offset, &mut raw[..T::SIZE])?;
        if count < T::SIZE {
            return Err(Error::EndOfStream {
                relative_offset: self.relative_offset(),
                requested: u64::from(size),
                length: u64::from(self.length),
            });
        }

        Ok(T::from_le_slice(&raw))
    }

    /// Reads a single byte.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] at the end of the window.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.read::<u8>()
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.read::<u16>()
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read::<u32>()
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read::<u64>()
    }

    /// Reads a signed byte.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] at the end of the window.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.read::<i8>()
    }

    /// Reads a little-endian `i16`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.read::<i16>()
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read::<i32>()
    }

    /// Reads a little-endian `i64`.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.read::<i64>()
    }

    /// Reads a little-endian IEEE 754 single.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.read::<f32>()
    }

    /// Reads a little-endian IEEE 754 double.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.read::<f64>()
    }

    /// Reads a pointer-sized integer.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_native_int(&mut self, is_32bit: bool) -> Result<u64> {
        if is_32bit {
            Ok(u64::from(self.read_u32()?))
        } else {
            self.read_u64()
        }
    }

    /// Reads an index that is either 2 or 4 bytes wide.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_index(&mut self, wide: bool) -> Result<u32> {
        if wide {
            self.read_u32()
        } else {
            Ok(u32::from(self.read_u16()?))
        }
    }

    /// Best-effort copy of up to `buffer.len()` bytes into `buffer`.
    ///
    /// Returns the number of bytes actually read, which is short at the end of the window.
    pub fn read_bytes(&mut self, buffer: &mut [u8]) -> usize {
        let count = buffer.len().min(self.remaining() as usize);
        if count == 0 {
            return 0;
        }

        let read = self
            .source
            .read_bytes(self.offset, &mut buffer[..count])
            .unwrap_or(0);
        self.offset += read as u64;
        read
    }

    /// Reads exactly `count` bytes into a new buffer.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if fewer than `count` bytes remain.
    pub fn read_exact(&mut self, count: u32) -> Result<Vec<u8>> {
        ensure_can_read!(self, count);

        let mut buffer = vec![0u8; count as usize];
        let start = self.relative_offset();
        if self.read_bytes(&mut buffer) != count as usize {
            self.offset = self.start_offset + start;
            return Err(Error::EndOfStream {
                relative_offset: start,
                requested: u64::from(count),
                length: u64::from(self.length),
            });
        }

        Ok(buffer)
    }

    /// Reads all remaining bytes of the window.
    #[must_use]
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.remaining() as usize];
        let read = self.read_bytes(&mut buffer);
        buffer.truncate(read);
        buffer
    }

    /// Reads bytes up to and including `delimiter`, or to the end of the window.
    pub fn read_bytes_until(&mut self, delimiter: u8) -> Vec<u8> {
        let mut result = Vec::new();
        while let Ok(byte) = self.read_u8() {
            result.push(byte);
            if byte == delimiter {
                break;
            }
        }
        result
    }

    /// Reads a zero-terminated ASCII string. The terminator is consumed but not returned.
    pub fn read_ascii_string(&mut self) -> String {
        let mut bytes = self.read_bytes_until(0);
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes.into_iter().map(char::from).collect()
    }

    /// Reads a zero-terminated UTF-16 string. The terminator is consumed but not returned.
    pub fn read_unicode_string(&mut self) -> String {
        let mut units = Vec::new();
        while let Ok(unit) = self.read_u16() {
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        U16String::from_vec(units).to_string_lossy()
    }

    /// Reads a UTF-16 string prefixed with its length in characters (as a `u16`).
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the window is too short.
    pub fn read_prefixed_unicode_string(&mut self) -> Result<String> {
        let count = self.read_u16()?;
        ensure_can_read!(self, u32::from(count) * 2);

        let mut units = Vec::with_capacity(count as usize);
        for _ in 0..count {
            units.push(self.read_u16()?);
        }
        Ok(U16String::from_vec(units).to_string_lossy())
    }

    /// Reads an integer in the metadata blob compressed format (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] on an invalid prefix and [`Error::EndOfStream`] if truncated.
    pub fn read_compressed_u32(&mut self) -> Result<u32> {
        let start = self.offset;
        let result = self.read_compressed_u32_inner();
        if result.is_err() {
            self.offset = start;
        }
        result
    }

    fn read_compressed_u32_inner(&mut self) -> Result<u32> {
        let first_byte = self.read_u8()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_u8()?;
            return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte));
        }

        // 4-byte encoding: 110xxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_u8()?);
            let b2 = u32::from(self.read_u8()?);
            let b3 = u32::from(self.read_u8()?);
            return Ok(((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Non-failing variant of [`BinaryStreamReader::read_compressed_u32`]. The cursor is left
    /// untouched when `None` is returned.
    pub fn try_read_compressed_u32(&mut self) -> Option<u32> {
        self.read_compressed_u32().ok()
    }

    /// Reads a signed integer in the metadata blob compressed format (rotated sign bit).
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] on an invalid prefix and [`Error::EndOfStream`] if truncated.
    pub fn read_compressed_i32(&mut self) -> Result<i32> {
        let first_byte = self.peek::<u8>()?;
        let unsigned = self.read_compressed_u32()?;

        let sign_extend = if (first_byte & 0x80) == 0 {
            0xFFFF_FFC0u32
        } else if (first_byte & 0xC0) == 0x80 {
            0xFFFF_E000u32
        } else {
            0xF000_0000u32
        };

        let value = unsigned >> 1;
        #[allow(clippy::cast_possible_wrap)]
        let result = if (unsigned & 1) == 0 {
            value as i32
        } else {
            (value | sign_extend) as i32
        };
        Ok(result)
    }

    /// Reads an integer in the MSB-continuation 7-bit format.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if more than 5 bytes are used and [`Error::EndOfStream`] if
    /// truncated.
    pub fn read_7bit_encoded_i32(&mut self) -> Result<i32> {
        let mut value = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7F) << shift;

            if (byte & 0x80) == 0 {
                break;
            }

            shift += 7;
            if shift > 28 {
                return Err(malformed_error!(
                    "7-bit encoded integer overflow after {} bits",
                    shift
                ));
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        Ok(value as i32)
    }

    /// Reads a serialized string: a compressed length followed by UTF-8 bytes. A leading `0xFF`
    /// denotes a null string and yields `None`.
    ///
    /// # Errors
    /// Returns an error if the string is truncated or not valid UTF-8.
    pub fn read_ser_string(&mut self) -> Result<Option<String>> {
        if self.peek::<u8>()? == 0xFF {
            self.offset += 1;
            return Ok(None);
        }

        let length = self.read_compressed_u32()?;
        let bytes = self.read_exact(length)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| malformed_error!("Invalid UTF-8 serialized string: {}", e.utf8_error()))
    }

    /// Reads a string prefixed with a 7-bit encoded byte length (`BinaryReader.ReadString`).
    ///
    /// # Errors
    /// Returns an error if the string is truncated or not valid UTF-8.
    pub fn read_binary_formatter_string(&mut self) -> Result<String> {
        let length = u32::try_from(self.read_7bit_encoded_i32()?)
            .map_err(|_| malformed_error!("Negative string length"))?;
        let bytes = self.read_exact(length)?;
        String::from_utf8(bytes)
            .map_err(|e| malformed_error!("Invalid UTF-8 string: {}", e.utf8_error()))
    }

    /// Captures the next `count` bytes as a [`DataSegment`] bound to this reader's coordinates.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if fewer than `count` bytes remain.
    pub fn read_segment(&mut self, count: u32) -> Result<DataSegment> {
        let offset = self.offset;
        let rva = self.rva();
        let data = self.read_exact(count)?;
        Ok(DataSegment::with_location(data, offset, rva))
    }

    /// Copies the remainder of the window to `writer` in 4096-byte chunks. Bytes the source
    /// cannot serve are written as zeroes so the output keeps the window's size.
    ///
    /// # Errors
    /// Returns any error produced by the writer.
    pub fn write_to_output(&mut self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let mut buffer = [0u8; COPY_CHUNK_SIZE];

        while self.remaining() > 0 {
            let chunk = (self.remaining() as usize).min(COPY_CHUNK_SIZE);
            let read = self.read_bytes(&mut buffer[..chunk]);

            if read < chunk {
                buffer[read..chunk].fill(0);
                self.offset += (chunk - read) as u64;
            }

            writer.write_bytes(&buffer[..chunk])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DataSourceSlice, MemoryStreamWriter};

    fn reader(data: &[u8]) -> BinaryStreamReader {
        BinaryStreamReader::from_bytes(data.to_vec())
    }

    #[test]
    fn fixed_width_reads() {
        let mut r = reader(&[
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
            0x0F,
        ]);

        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0302);
        assert_eq!(r.read_u32().unwrap(), 0x0706_0504);
        assert_eq!(r.read_u64().unwrap(), 0x0F0E_0D0C_0B0A_0908);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn constructor_is_fail_fast() {
        let source: DataSourceRef = Arc::new(ByteArrayDataSource::new(vec![0; 16]));

        assert!(BinaryStreamReader::new(source.clone(), 0, 0, 16).is_ok());
        assert!(BinaryStreamReader::new(source.clone(), 8, 0, 8).is_ok());
        assert!(matches!(
            BinaryStreamReader::new(source.clone(), 8, 0, 9),
            Err(Error::EndOfStream { .. })
        ));
        assert!(BinaryStreamReader::new(source.clone(), 17, 0, 1).is_err());
        assert!(BinaryStreamReader::new(source, 100, 0, 0).is_ok());
    }

    #[test]
    fn failing_read_does_not_advance() {
        let mut r = reader(&[1, 2, 3, 4, 5]);
        r.read_u16().unwrap();

        assert!(!r.can_read(4));
        assert!(r.read_u32().is_err());
        assert_eq!(r.relative_offset(), 2);
        assert_eq!(r.read_u8().unwrap(), 3);
    }

    #[test]
    fn read_bytes_is_best_effort() {
        let mut r = reader(&[1, 2, 3]);
        let mut buffer = [0u8; 8];

        assert_eq!(r.read_bytes(&mut buffer), 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);
        assert_eq!(r.read_bytes(&mut buffer), 0);
    }

    #[test]
    fn rva_tracking_and_forks() {
        let source: DataSourceRef = Arc::new(ByteArrayDataSource::new((0u8..64).collect()));
        let mut r = BinaryStreamReader::new(source, 0x10, 0x2000, 0x20).unwrap();

        r.read_u32().unwrap();
        assert_eq!(r.offset(), 0x14);
        assert_eq!(r.relative_offset(), 4);
        assert_eq!(r.rva(), 0x2004);

        let fork = r.fork();
        assert_eq!(fork.offset(), r.offset());
        r.read_u32().unwrap();
        assert_eq!(fork.offset(), 0x14);

        let mut absolute = r.fork_absolute_sized(0x18, 4).unwrap();
        assert_eq!(absolute.start_rva(), 0x2008);
        assert_eq!(absolute.read_u8().unwrap(), 0x18);
        assert_eq!(absolute.length(), 4);

        let relative = r.fork_relative(0x10).unwrap();
        assert_eq!(relative.offset(), 0x20);
        assert_eq!(relative.rva(), 0x2010);
        assert_eq!(relative.length(), 0x10);

        assert!(r.fork_absolute(0x0F).is_err());
        assert!(r.fork_absolute(0x31).is_err());
    }

    #[test]
    fn seeking() {
        let mut r = reader(&[0; 8]);
        r.set_relative_offset(8).unwrap();
        assert_eq!(r.remaining(), 0);
        assert!(r.set_relative_offset(9).is_err());
        r.set_rva(2).unwrap();
        assert_eq!(r.offset(), 2);
    }

    #[test]
    fn compressed_unsigned() {
        let mut r = reader(&[0x03, 0x7F, 0x80, 0x80, 0xAE, 0x57, 0xBF, 0xFF, 0xC0, 0x00, 0x40, 0x00]);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x03);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x7F);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x80);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x2E57);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x3FFF);
        assert_eq!(r.read_compressed_u32().unwrap(), 0x4000);
    }

    #[test]
    fn compressed_invalid_prefix() {
        let mut r = reader(&[0xFF, 0x00]);
        assert!(matches!(r.read_compressed_u32(), Err(Error::Malformed { .. })));
        assert_eq!(r.relative_offset(), 0);
        assert_eq!(r.try_read_compressed_u32(), None);
    }

    #[test]
    fn compressed_signed() {
        // ECMA-335 II.23.2 examples
        let mut r = reader(&[0x06, 0x7B, 0x80, 0x80, 0x01, 0xC0, 0x00, 0x40, 0x00, 0x80, 0x01]);
        assert_eq!(r.read_compressed_i32().unwrap(), 3);
        assert_eq!(r.read_compressed_i32().unwrap(), -3);
        assert_eq!(r.read_compressed_i32().unwrap(), 64);
        assert_eq!(r.read_compressed_i32().unwrap(), -64);
        assert_eq!(r.read_compressed_i32().unwrap(), 8192);
        assert_eq!(r.read_compressed_i32().unwrap(), -8192);
    }

    #[test]
    fn seven_bit_encoded() {
        let mut r = reader(&[0x7F, 0x80, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        assert_eq!(r.read_7bit_encoded_i32().unwrap(), 127);
        assert_eq!(r.read_7bit_encoded_i32().unwrap(), 128);
        assert_eq!(r.read_7bit_encoded_i32().unwrap(), i32::MAX);

        let mut overflow = reader(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(overflow.read_7bit_encoded_i32().is_err());
    }

    #[test]
    fn strings() {
        let mut r = reader(b"abc\0rest");
        assert_eq!(r.read_ascii_string(), "abc");
        assert_eq!(r.read_ascii_string(), "rest");

        let mut r = reader(&[b'H', 0, b'i', 0, 0, 0]);
        assert_eq!(r.read_unicode_string(), "Hi");
        assert_eq!(r.remaining(), 0);

        let mut r = reader(&[0xFF, 0x03, b'f', b'o', b'o']);
        assert_eq!(r.read_ser_string().unwrap(), None);
        assert_eq!(r.read_ser_string().unwrap().as_deref(), Some("foo"));

        let mut r = reader(&[0x02, b'o', b'k']);
        assert_eq!(r.read_binary_formatter_string().unwrap(), "ok");
    }

    #[test]
    fn alignment() {
        let source: DataSourceRef = Arc::new(ByteArrayDataSource::new(vec![0; 32]));
        let mut r = BinaryStreamReader::new(source, 0, 0, 10).unwrap();
        r.skip(1).unwrap();
        r.align(4);
        assert_eq!(r.offset(), 4);
        r.skip(5).unwrap();
        r.align(4);
        assert_eq!(r.offset(), 10);
    }

    #[test]
    fn write_to_output_copies_window() {
        let backing: DataSourceRef = Arc::new(ByteArrayDataSource::new(vec![7; 8]));
        let slice: DataSourceRef = Arc::new(DataSourceSlice::new(backing, 0, 8).unwrap());
        let mut r = BinaryStreamReader::new(slice, 2, 0, 6).unwrap();
        let mut writer = MemoryStreamWriter::new();

        r.write_to_output(&mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[7; 6]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn read_segment_keeps_coordinates() {
        let source: DataSourceRef = Arc::new(ByteArrayDataSource::new((0u8..16).collect()));
        let mut r = BinaryStreamReader::new(source, 4, 0x1004, 8).unwrap();
        r.skip(2).unwrap();

        let segment = r.read_segment(3).unwrap();
        assert_eq!(segment.data(), &[6, 7, 8]);
        assert_eq!(crate::segment::Segment::offset(&segment), 6);
        assert_eq!(crate::segment::Segment::rva(&segment), 0x1006);
    }
}
