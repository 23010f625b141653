//! Metadata heaps (`#Strings`, `#US`, `#Blob`, `#GUID`).
//!
//! Readers resolve heap indices found in table columns and instruction operands. The builders
//! append values and hand out the indices, deduplicating identical entries.
//!
//! # Reference
//! - [ECMA-335 II.24.2.2 - II.24.2.5](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use std::collections::HashMap;

use uguid::Guid;
use widestring::{U16Str, U16String};

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    utils::to_u32,
    Error, Result,
};

/// Name of the strings heap.
pub const STRINGS_STREAM_NAME: &str = "#Strings";
/// Name of the user strings heap.
pub const USER_STRINGS_STREAM_NAME: &str = "#US";
/// Name of the blob heap.
pub const BLOB_STREAM_NAME: &str = "#Blob";
/// Name of the GUID heap.
pub const GUID_STREAM_NAME: &str = "#GUID";

fn fork_at(reader: &BinaryStreamReader, index: u32) -> Result<BinaryStreamReader> {
    if index >= reader.length() {
        return Err(Error::IndexOutOfRange {
            index: index as usize,
            count: reader.length() as usize,
        });
    }
    reader.fork_relative(u64::from(index))
}

/// `#Strings`: zero-terminated UTF-8 identifiers.
#[derive(Debug, Clone)]
pub struct StringsHeap {
    reader: BinaryStreamReader,
}

impl StringsHeap {
    /// Wraps the heap covered by `reader`.
    #[must_use]
    pub fn new(reader: BinaryStreamReader) -> Self {
        StringsHeap { reader }
    }

    /// The string at `index`. Index 0 is the empty string.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an index past the heap.
    pub fn get(&self, index: u32) -> Result<String> {
        if index == 0 {
            return Ok(String::new());
        }
        let mut reader = fork_at(&self.reader, index)?;
        let mut bytes = reader.read_bytes_until(0);
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// `#US`: length-prefixed UTF-16 literals referenced by `ldstr`.
#[derive(Debug, Clone)]
pub struct UserStringsHeap {
    reader: BinaryStreamReader,
}

impl UserStringsHeap {
    /// Wraps the heap covered by `reader`.
    #[must_use]
    pub fn new(reader: BinaryStreamReader) -> Self {
        UserStringsHeap { reader }
    }

    /// The literal at `index`, as the UTF-16 units stored in the heap. Unpaired surrogates are
    /// kept.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an index past the heap, or
    /// [`Error::Malformed`] for a length that exceeds the heap.
    pub fn get(&self, index: u32) -> Result<U16String> {
        if index == 0 {
            return Ok(U16String::new());
        }
        let mut reader = fork_at(&self.reader, index)?;
        let length = reader.read_compressed_u32()?;
        if !reader.can_read(length) {
            return Err(malformed_error!(
                "User string at 0x{:X} declares {} bytes past the end of the heap",
                index,
                length
            ));
        }

        // The final byte is the "special characters" flag.
        let units: Vec<u16> = (0..length / 2)
            .map(|_| reader.read_u16())
            .collect::<Result<_>>()?;
        Ok(U16String::from_vec(units))
    }
}

/// `#Blob`: length-prefixed byte sequences (signatures, constants, custom attributes).
#[derive(Debug, Clone)]
pub struct BlobHeap {
    reader: BinaryStreamReader,
}

impl BlobHeap {
    /// Wraps the heap covered by `reader`.
    #[must_use]
    pub fn new(reader: BinaryStreamReader) -> Self {
        BlobHeap { reader }
    }

    /// A reader over the blob at `index`, bounded to its declared length.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an index past the heap, or
    /// [`Error::Malformed`] for a length that exceeds the heap.
    pub fn reader(&self, index: u32) -> Result<BinaryStreamReader> {
        let mut reader = fork_at(&self.reader, index)?;
        let length = reader.read_compressed_u32()?;
        if !reader.can_read(length) {
            return Err(malformed_error!(
                "Blob at 0x{:X} declares {} bytes past the end of the heap",
                index,
                length
            ));
        }
        reader.fork_relative_sized(reader.relative_offset(), length)
    }

    /// A copy of the blob at `index`.
    ///
    /// # Errors
    /// See [`BlobHeap::reader`].
    pub fn get(&self, index: u32) -> Result<Vec<u8>> {
        Ok(self.reader(index)?.read_to_end())
    }
}

/// `#GUID`: 16-byte GUIDs addressed by 1-based index.
#[derive(Debug, Clone)]
pub struct GuidHeap {
    reader: BinaryStreamReader,
}

impl GuidHeap {
    /// Wraps the heap covered by `reader`.
    #[must_use]
    pub fn new(reader: BinaryStreamReader) -> Self {
        GuidHeap { reader }
    }

    /// The GUID at 1-based `index`; index 0 is the zero GUID.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an index past the heap.
    pub fn get(&self, index: u32) -> Result<Guid> {
        if index == 0 {
            return Ok(Guid::ZERO);
        }
        let mut reader = fork_at(&self.reader, (index - 1) * 16)?;
        let mut bytes = [0u8; 16];
        if reader.read_bytes(&mut bytes) != 16 {
            return Err(Error::IndexOutOfRange {
                index: index as usize,
                count: (self.reader.length() / 16) as usize,
            });
        }
        Ok(Guid::from_bytes(bytes))
    }
}

/// Appends byte sequences to a new `#Blob` heap.
#[derive(Debug, Clone)]
pub struct BlobHeapBuilder {
    writer: MemoryStreamWriter,
    index: HashMap<Vec<u8>, u32>,
}

impl Default for BlobHeapBuilder {
    fn default() -> Self {
        let mut writer = MemoryStreamWriter::new();
        let _ = writer.write_u8(0);
        BlobHeapBuilder {
            writer,
            index: HashMap::new(),
        }
    }
}

impl BlobHeapBuilder {
    /// Creates a heap containing only the empty blob.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a blob and returns its index. The empty blob is index 0.
    ///
    /// # Errors
    /// Returns an error if the heap exceeds 4 GiB.
    pub fn add(&mut self, blob: &[u8]) -> Result<u32> {
        if blob.is_empty() {
            return Ok(0);
        }
        if let Some(&index) = self.index.get(blob) {
            return Ok(index);
        }

        let index = to_u32(self.writer.as_slice().len())?;
        self.writer.write_compressed_u32(to_u32(blob.len())?)?;
        self.writer.write_bytes(blob)?;
        self.index.insert(blob.to_vec(), index);
        Ok(index)
    }

    /// The heap, padded to 4 bytes.
    ///
    /// # Errors
    /// Returns an error if the writer fails.
    pub fn build(mut self) -> Result<Vec<u8>> {
        self.writer.align(4)?;
        Ok(self.writer.into_inner())
    }
}

/// Appends identifiers to a new `#Strings` heap.
#[derive(Debug, Clone)]
pub struct StringsHeapBuilder {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Default for StringsHeapBuilder {
    fn default() -> Self {
        StringsHeapBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }
}

impl StringsHeapBuilder {
    /// Creates a heap containing only the empty string.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a string and returns its index. The empty string is index 0.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for strings containing NUL.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if value.contains('\0') {
            return Err(Error::InvalidArgument(format!(
                "Identifier {value:?} contains a NUL character"
            )));
        }
        if let Some(&index) = self.index.get(value) {
            return Ok(index);
        }

        let index = to_u32(self.data.len())?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.index.insert(value.to_string(), index);
        Ok(index)
    }

    /// The heap, padded to 4 bytes.
    #[must_use]
    pub fn build(mut self) -> Vec<u8> {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        self.data
    }
}

/// Appends literals to a new `#US` heap.
#[derive(Debug, Clone)]
pub struct UserStringsHeapBuilder {
    writer: MemoryStreamWriter,
    index: HashMap<U16String, u32>,
}

impl Default for UserStringsHeapBuilder {
    fn default() -> Self {
        let mut writer = MemoryStreamWriter::new();
        let _ = writer.write_u8(0);
        UserStringsHeapBuilder {
            writer,
            index: HashMap::new(),
        }
    }
}

impl UserStringsHeapBuilder {
    /// Creates a heap containing only the empty entry at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a literal and returns its index.
    ///
    /// # Errors
    /// Returns an error if the heap would exceed the 24-bit token range.
    pub fn add(&mut self, value: &U16Str) -> Result<u32> {
        if let Some(&index) = self.index.get(value) {
            return Ok(index);
        }

        let index = to_u32(self.writer.as_slice().len())?;
        if index > 0x00FF_FFFF {
            return Err(Error::InvalidArgument(
                "User string heap exceeds the token range".to_string(),
            ));
        }

        let units = value.as_slice();
        self.writer
            .write_compressed_u32(to_u32(units.len() * 2 + 1)?)?;
        for &unit in units {
            self.writer.write_u16(unit)?;
        }
        self.writer
            .write_u8(u8::from(units.iter().any(|&unit| is_special(unit))))?;

        self.index.insert(value.to_ustring(), index);
        Ok(index)
    }

    /// The heap, padded to 4 bytes.
    ///
    /// # Errors
    /// Returns an error if the writer fails.
    pub fn build(mut self) -> Result<Vec<u8>> {
        self.writer.align(4)?;
        Ok(self.writer.into_inner())
    }
}

fn is_special(unit: u16) -> bool {
    unit > 0xFF
        || matches!(unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings() {
        let mut builder = StringsHeapBuilder::new();
        let main = builder.add("Main").unwrap();
        let ctor = builder.add(".ctor").unwrap();
        assert_eq!(builder.add("Main").unwrap(), main);
        assert_eq!(builder.add("").unwrap(), 0);

        let heap = StringsHeap::new(BinaryStreamReader::from_bytes(builder.build()));
        assert_eq!(heap.get(main).unwrap(), "Main");
        assert_eq!(heap.get(ctor).unwrap(), ".ctor");
        assert_eq!(heap.get(0).unwrap(), "");
        assert!(heap.get(0x100).is_err());
    }

    #[test]
    fn user_strings() {
        let mut builder = UserStringsHeapBuilder::new();
        let hello = builder.add(&U16String::from_str("Hello")).unwrap();
        let special = builder.add(&U16String::from_str("don't")).unwrap();
        assert_eq!(hello, 1);

        let data = builder.build().unwrap();
        // Length 11 = 5 * 2 + 1, terminal flag 0.
        assert_eq!(data[1], 11);
        assert_eq!(data[12], 0);
        assert_eq!(data[usize::try_from(special).unwrap() + 11], 1);

        let heap = UserStringsHeap::new(BinaryStreamReader::from_bytes(data));
        assert_eq!(heap.get(hello).unwrap().to_string_lossy(), "Hello");
        assert_eq!(heap.get(special).unwrap().to_string_lossy(), "don't");
        assert!(heap.get(0).unwrap().is_empty());
    }

    #[test]
    fn unpaired_surrogates_are_kept() {
        // Length 3 = 1 * 2 + 1: a lone high surrogate, flagged as special.
        let heap = UserStringsHeap::new(BinaryStreamReader::from_bytes(vec![
            0x00, 0x03, 0x00, 0xD8, 0x01, 0x00, 0x00, 0x00,
        ]));
        let literal = heap.get(1).unwrap();
        assert_eq!(literal.as_slice(), &[0xD800]);

        let mut builder = UserStringsHeapBuilder::new();
        assert_eq!(builder.add(&literal).unwrap(), 1);
        let data = builder.build().unwrap();
        assert_eq!(&data[..5], &[0x00, 0x03, 0x00, 0xD8, 0x01]);
    }

    #[test]
    fn blobs() {
        let mut builder = BlobHeapBuilder::new();
        let signature = builder.add(&[0x06, 0x08]).unwrap();
        assert_eq!(signature, 1);
        assert_eq!(builder.add(&[0x06, 0x08]).unwrap(), 1);

        let heap = BlobHeap::new(BinaryStreamReader::from_bytes(builder.build().unwrap()));
        assert_eq!(heap.get(signature).unwrap(), vec![0x06, 0x08]);

        let mut reader = heap.reader(signature).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 0x06);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn truncated_blob() {
        let heap = BlobHeap::new(BinaryStreamReader::from_bytes(vec![0, 0x10, 1, 2]));
        assert!(heap.get(1).unwrap_err().is_malformed());
    }

    #[test]
    fn guids() {
        let mut bytes = vec![0u8; 32];
        bytes[16] = 0xAB;
        let heap = GuidHeap::new(BinaryStreamReader::from_bytes(bytes));
        assert_eq!(heap.get(0).unwrap(), Guid::ZERO);
        assert_eq!(heap.get(2).unwrap().to_bytes()[0], 0xAB);
        assert!(heap.get(3).is_err());
    }
}
