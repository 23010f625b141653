//! Positioned binary output.
//!
//! [`BinaryStreamWriter`] is the sink every segment serializes into. Implementors only provide
//! the four positioning primitives; all encodings (fixed-width values, compressed integers,
//! serialized strings, padding) are provided methods, so they behave identically whether the
//! target is a growable buffer ([`MemoryStreamWriter`]), an OS stream ([`IoStreamWriter`]) or a
//! memory-mapped file ([`crate::io::MmapOutput`]).

use std::io::{Seek, SeekFrom, Write};

use widestring::U16String;

use super::primitives::Primitive;
use crate::{utils::align_up, Error, Result};

/// A positioned, little-endian binary sink.
pub trait BinaryStreamWriter {
    /// Current write position, relative to the start of the stream.
    fn offset(&self) -> u64;

    /// Moves the write position. Moving past the end is allowed; the gap is zero-filled on the
    /// next write where the target supports it.
    ///
    /// # Errors
    /// Returns an error if the target cannot seek to `offset`.
    fn set_offset(&mut self, offset: u64) -> Result<()>;

    /// Number of bytes currently in the stream.
    fn length(&self) -> u64;

    /// Writes `data` at the current position and advances past it.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Writes a fixed-width value in little-endian order.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_le<T: Primitive>(&mut self, value: T) -> Result<()>
    where
        Self: Sized,
    {
        let mut raw = [0u8; 8];
        value.write_le_slice(&mut raw);
        self.write_bytes(&raw[..T::SIZE])
    }

    /// Writes a byte.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Writes a signed byte.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `u16`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `i16`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `u32`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `i32`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian `i64`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian IEEE 754 single.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a little-endian IEEE 754 double.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes `count` zero bytes.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_zeroes(&mut self, count: u64) -> Result<()> {
        const ZEROES: [u8; 512] = [0; 512];

        let mut left = count;
        while left > 0 {
            let chunk = left.min(ZEROES.len() as u64);
            #[allow(clippy::cast_possible_truncation)]
            self.write_bytes(&ZEROES[..chunk as usize])?;
            left -= chunk;
        }
        Ok(())
    }

    /// Pads with zeroes until the position is a multiple of `alignment`.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn align(&mut self, alignment: u32) -> Result<()> {
        let offset = self.offset();
        let aligned = align_up(offset, u64::from(alignment));
        self.write_zeroes(aligned - offset)
    }

    /// Writes a pointer-sized integer.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write or the value does not fit 32 bits on a
    /// 32-bit target.
    fn write_native_int(&mut self, value: u64, is_32bit: bool) -> Result<()> {
        if is_32bit {
            let value = u32::try_from(value).map_err(|_| {
                Error::InvalidArgument(format!("0x{value:X} does not fit a 32-bit native int"))
            })?;
            self.write_u32(value)
        } else {
            self.write_u64(value)
        }
    }

    /// Writes an index that is either 2 or 4 bytes wide.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write or the value does not fit 16 bits when
    /// `wide` is false.
    fn write_index(&mut self, value: u32, wide: bool) -> Result<()> {
        if wide {
            self.write_u32(value)
        } else {
            let value = u16::try_from(value)
                .map_err(|_| Error::InvalidArgument(format!("Index {value} does not fit 16 bits")))?;
            self.write_u16(value)
        }
    }

    /// Writes an integer in the metadata blob compressed format (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for values above `0x1FFF_FFFF`.
    fn write_compressed_u32(&mut self, value: u32) -> Result<()> {
        if value < 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.write_u8(value as u8)
        } else if value < 0x4000 {
            #[allow(clippy::cast_possible_truncation)]
            self.write_bytes(&[0x80 | (value >> 8) as u8, value as u8])
        } else if value <= 0x1FFF_FFFF {
            self.write_bytes(&(0xC000_0000 | value).to_be_bytes())
        } else {
            Err(Error::InvalidArgument(format!(
                "{value} is too large for the compressed integer format"
            )))
        }
    }

    /// Writes an integer in the MSB-continuation 7-bit format.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_7bit_encoded_i32(&mut self, value: i32) -> Result<()> {
        #[allow(clippy::cast_sign_loss)]
        let mut value = value as u32;
        loop {
            #[allow(clippy::cast_possible_truncation)]
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    /// Writes a serialized string: `0xFF` for `None`, otherwise a compressed byte length followed
    /// by the UTF-8 bytes.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_ser_string(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            None => self.write_u8(0xFF),
            Some(value) => {
                let length = u32::try_from(value.len())
                    .map_err(|_| Error::InvalidArgument("String too long".to_string()))?;
                self.write_compressed_u32(length)?;
                self.write_bytes(value.as_bytes())
            }
        }
    }

    /// Writes a string prefixed with its 7-bit encoded byte length.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_binary_formatter_string(&mut self, value: &str) -> Result<()> {
        let length = i32::try_from(value.len())
            .map_err(|_| Error::InvalidArgument("String too long".to_string()))?;
        self.write_7bit_encoded_i32(length)?;
        self.write_bytes(value.as_bytes())
    }

    /// Writes a UTF-16 string prefixed with its length in code units (as a `u16`).
    ///
    /// # Errors
    /// Returns an error if the target rejects the write or the string exceeds 65535 units.
    fn write_prefixed_unicode_string(&mut self, value: &str) -> Result<()> {
        let encoded = U16String::from_str(value);
        let length = u16::try_from(encoded.len())
            .map_err(|_| Error::InvalidArgument("String too long".to_string()))?;
        self.write_u16(length)?;
        for unit in encoded.as_slice() {
            self.write_u16(*unit)?;
        }
        Ok(())
    }

    /// Writes a zero-terminated ASCII string.
    ///
    /// # Errors
    /// Returns an error if the target rejects the write.
    fn write_ascii_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())?;
        self.write_u8(0)
    }
}

/// A growable in-memory [`BinaryStreamWriter`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStreamWriter {
    data: Vec<u8>,
    position: usize,
}

impl MemoryStreamWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with a preallocated buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        MemoryStreamWriter {
            data: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the writer, returning its buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BinaryStreamWriter for MemoryStreamWriter {
    fn offset(&self) -> u64 {
        self.position as u64
    }

    fn set_offset(&mut self, offset: u64) -> Result<()> {
        self.position = usize::try_from(offset).map_err(|_| Error::AddressOutOfRange(offset))?;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let end = self.position + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(data);
        self.position = end;
        Ok(())
    }
}

/// A [`BinaryStreamWriter`] over any seekable [`std::io::Write`].
pub struct IoStreamWriter<W> {
    inner: W,
    position: u64,
    length: u64,
}

impl<W: Write + Seek> IoStreamWriter<W> {
    /// Wraps `inner`, which is assumed to be positioned at its start.
    pub fn new(inner: W) -> Self {
        IoStreamWriter {
            inner,
            position: 0,
            length: 0,
        }
    }

    /// Flushes and returns the wrapped stream.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if flushing fails.
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write + Seek> BinaryStreamWriter for IoStreamWriter<W> {
    fn offset(&self) -> u64 {
        self.position
    }

    fn set_offset(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        self.length = self.length.max(self.position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::io::BinaryStreamReader;

    #[test]
    fn fixed_width_writes() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_u8(0x01).unwrap();
        writer.write_u16(0x0302).unwrap();
        writer.write_u32(0x0706_0504).unwrap();
        writer.write_le(-1i16).unwrap();

        assert_eq!(writer.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 0xFF, 0xFF]);
        assert_eq!(writer.offset(), 9);
    }

    #[test]
    fn overwrite_after_seek() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_u32(0).unwrap();
        writer.set_offset(1).unwrap();
        writer.write_u8(0xAA).unwrap();
        assert_eq!(writer.as_slice(), &[0, 0xAA, 0, 0]);

        writer.set_offset(6).unwrap();
        writer.write_u8(0xBB).unwrap();
        assert_eq!(writer.as_slice(), &[0, 0xAA, 0, 0, 0, 0, 0xBB]);
    }

    #[test]
    fn compressed_unsigned() {
        let mut writer = MemoryStreamWriter::new();
        for value in [0x03, 0x7F, 0x80, 0x2E57, 0x3FFF, 0x4000, 0x1FFF_FFFF] {
            writer.write_compressed_u32(value).unwrap();
        }

        assert_eq!(
            writer.as_slice(),
            &[
                0x03, 0x7F, 0x80, 0x80, 0xAE, 0x57, 0xBF, 0xFF, 0xC0, 0x00, 0x40, 0x00, 0xDF,
                0xFF, 0xFF, 0xFF
            ]
        );
        assert!(writer.write_compressed_u32(0x2000_0000).is_err());
    }

    #[test]
    fn seven_bit_encoded() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_7bit_encoded_i32(0).unwrap();
        writer.write_7bit_encoded_i32(127).unwrap();
        writer.write_7bit_encoded_i32(128).unwrap();
        writer.write_7bit_encoded_i32(-1).unwrap();

        assert_eq!(
            writer.as_slice(),
            &[0x00, 0x7F, 0x80, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]
        );
    }

    #[test]
    fn strings_read_back() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_ser_string(None).unwrap();
        writer.write_ser_string(Some("System.Int32")).unwrap();
        writer.write_prefixed_unicode_string("Hé").unwrap();
        writer.write_ascii_string("mscoree.dll").unwrap();

        let mut reader = BinaryStreamReader::from_bytes(writer.into_inner());
        assert_eq!(reader.read_ser_string().unwrap(), None);
        assert_eq!(reader.read_ser_string().unwrap().as_deref(), Some("System.Int32"));
        assert_eq!(reader.read_prefixed_unicode_string().unwrap(), "Hé");
        assert_eq!(reader.read_ascii_string(), "mscoree.dll");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn alignment_and_padding() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_u8(1).unwrap();
        writer.align(4).unwrap();
        assert_eq!(writer.offset(), 4);
        writer.align(4).unwrap();
        assert_eq!(writer.offset(), 4);
        writer.write_zeroes(1000).unwrap();
        assert_eq!(writer.length(), 1004);
    }

    #[test]
    fn native_and_index() {
        let mut writer = MemoryStreamWriter::new();
        writer.write_native_int(0x1122_3344, true).unwrap();
        writer.write_native_int(1, false).unwrap();
        writer.write_index(0x10, false).unwrap();
        writer.write_index(0x10, true).unwrap();
        assert_eq!(writer.length(), 4 + 8 + 2 + 4);

        assert!(writer.write_native_int(u64::MAX, true).is_err());
        assert!(writer.write_index(0x1_0000, false).is_err());
    }

    #[test]
    fn io_stream_writer() {
        let mut writer = IoStreamWriter::new(Cursor::new(Vec::new()));
        writer.write_u32(0xDEAD_BEEF).unwrap();
        writer.set_offset(0).unwrap();
        writer.write_u8(0xAA).unwrap();

        assert_eq!(writer.offset(), 1);
        assert_eq!(writer.length(), 4);
        assert_eq!(writer.into_inner().unwrap().into_inner(), vec![0xAA, 0xBE, 0xAD, 0xDE]);
    }
}
