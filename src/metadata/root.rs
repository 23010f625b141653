//! Metadata root and stream headers.
//!
//! The metadata directory starts with the `BSJB` root: format version, runtime version string
//! and a table of stream headers, each naming a stream and locating it relative to the start
//! of the root.
//!
//! # Reference
//! - [ECMA-335 II.24.2.1](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter},
    utils::{align_up, align_up_u32},
    Result,
};

/// Signature of the metadata root (`BSJB`).
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// Longest stream name accepted, excluding the terminator.
pub const MAX_STREAM_NAME_LENGTH: usize = 32;

/// Location and name of a metadata stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream, relative to the metadata root.
    pub offset: u32,
    /// Size of the stream in bytes.
    pub size: u32,
    /// Name of the stream, such as `#~` or `#Strings`.
    pub name: String,
}

impl StreamHeader {
    /// Creates a stream header.
    #[must_use]
    pub fn new(name: impl Into<String>, offset: u32, size: u32) -> Self {
        StreamHeader {
            offset,
            size,
            name: name.into(),
        }
    }

    /// Reads a header, including its name padded to 4 bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for names longer than 32 characters.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let start = reader.relative_offset();
        let offset = reader.read_u32()?;
        let size = reader.read_u32()?;
        let name = reader.read_ascii_string();
        if name.len() > MAX_STREAM_NAME_LENGTH {
            return Err(malformed_error!("Stream name '{}' is too long", name));
        }

        let consumed = reader.relative_offset() - start;
        reader.set_relative_offset(start + align_up(consumed, 4))?;

        Ok(StreamHeader { offset, size, name })
    }

    /// Serialized size of this header.
    #[must_use]
    pub fn size(&self) -> u32 {
        8 + name_size(&self.name)
    }

    /// Writes the header.
    ///
    /// # Errors
    /// Returns an error if the writer fails.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_u32(self.offset)?;
        writer.write_u32(self.size)?;
        write_padded(writer, &self.name)
    }
}

/// The `BSJB` metadata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRoot {
    /// Major version of the metadata format, usually 1.
    pub major_version: u16,
    /// Minor version of the metadata format, usually 1.
    pub minor_version: u16,
    /// Reserved, usually 0.
    pub reserved: u32,
    /// Runtime version string, e.g. `v4.0.30319`.
    pub version: String,
    /// Reserved flags, usually 0.
    pub flags: u16,
    /// Stream headers in file order.
    pub streams: Vec<StreamHeader>,
}

impl Default for MetadataRoot {
    fn default() -> Self {
        MetadataRoot {
            major_version: 1,
            minor_version: 1,
            reserved: 0,
            version: String::from("v4.0.30319"),
            flags: 0,
            streams: Vec::new(),
        }
    }
}

impl MetadataRoot {
    /// Reads the root at the start of `reader`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad signature, or when a stream exceeds the
    /// bounds of the metadata directory.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let signature = reader.read_u32()?;
        if signature != METADATA_SIGNATURE {
            return Err(malformed_error!(
                "Invalid metadata signature 0x{:08X}",
                signature
            ));
        }

        let major_version = reader.read_u16()?;
        let minor_version = reader.read_u16()?;
        let reserved = reader.read_u32()?;

        let version_length = reader.read_u32()?;
        if !reader.can_read(version_length) {
            return Err(malformed_error!(
                "Version string length {} exceeds metadata size",
                version_length
            ));
        }
        let raw = reader.read_exact(version_length)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let version = String::from_utf8_lossy(&raw[..end]).into_owned();

        let flags = reader.read_u16()?;
        let count = reader.read_u16()?;

        let mut streams = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let header = StreamHeader::from_reader(reader)?;
            match header.offset.checked_add(header.size) {
                Some(end) if end <= reader.length() => {}
                _ => {
                    return Err(malformed_error!(
                        "Stream {} (0x{:X}, {} bytes) lies outside the metadata directory",
                        header.name,
                        header.offset,
                        header.size
                    ))
                }
            }
            streams.push(header);
        }

        Ok(MetadataRoot {
            major_version,
            minor_version,
            reserved,
            version,
            flags,
            streams,
        })
    }

    /// Looks up a stream header by name.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        // The runtime picks the last stream with a given name.
        self.streams.iter().rev().find(|stream| stream.name == name)
    }

    /// Serialized size of the root and its stream headers.
    #[must_use]
    pub fn size(&self) -> u32 {
        let streams: u32 = self.streams.iter().map(StreamHeader::size).sum();
        16 + name_size(&self.version) + 4 + streams
    }

    /// Writes the root and its stream headers.
    ///
    /// # Errors
    /// Returns an error if the writer fails or there are more than 65535 streams.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let count = u16::try_from(self.streams.len())
            .map_err(|_| crate::Error::InvalidArgument("Too many metadata streams".to_string()))?;

        writer.write_u32(METADATA_SIGNATURE)?;
        writer.write_u16(self.major_version)?;
        writer.write_u16(self.minor_version)?;
        writer.write_u32(self.reserved)?;
        writer.write_u32(name_size(&self.version))?;
        write_padded(writer, &self.version)?;
        writer.write_u16(self.flags)?;
        writer.write_u16(count)?;
        for stream in &self.streams {
            stream.write(writer)?;
        }
        Ok(())
    }
}

/// Size of a zero-terminated string padded to 4 bytes.
#[allow(clippy::cast_possible_truncation)]
fn name_size(name: &str) -> u32 {
    align_up_u32(name.len() as u32 + 1, 4)
}

fn write_padded(writer: &mut dyn BinaryStreamWriter, name: &str) -> Result<()> {
    writer.write_bytes(name.as_bytes())?;
    #[allow(clippy::cast_possible_truncation)]
    let padding = name_size(name) - name.len() as u32;
    writer.write_zeroes(u64::from(padding))
}
