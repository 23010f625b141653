//! Section headers and sections.

use std::fmt;

use bitflags::bitflags;

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter},
    segment::{RelocationParameters, Segment, SegmentOffsets, SegmentRef},
    utils::align_up_u32,
    Error, Result,
};

/// Size of one entry in the section table.
pub const SECTION_HEADER_SIZE: u32 = 40;

/// Maximum length of a section name in bytes.
pub const MAX_SECTION_NAME_LENGTH: usize = 8;

bitflags! {
    /// Section characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        /// Should not be padded to the next boundary (object files only)
        const TYPE_NO_PAD = 0x0000_0008;
        /// Contains executable code
        const CONTENT_CODE = 0x0000_0020;
        /// Contains initialized data
        const CONTENT_INITIALIZED_DATA = 0x0000_0040;
        /// Contains uninitialized data
        const CONTENT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Contains comments or other information (object files only)
        const LINK_INFO = 0x0000_0200;
        /// Will not become part of the image (object files only)
        const LINK_REMOVE = 0x0000_0800;
        /// COMDAT data (object files only)
        const LINK_COMDAT = 0x0000_1000;
        /// Data referenced through the global pointer
        const GP_RELATIVE = 0x0000_8000;
        /// Contains extended relocations
        const LINK_NRELOC_OVERFLOW = 0x0100_0000;
        /// Can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// Cannot be cached
        const MEM_NOT_CACHED = 0x0400_0000;
        /// Is not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// Can be shared in memory
        const MEM_SHARED = 0x1000_0000;
        /// Can be executed as code
        const MEM_EXECUTE = 0x2000_0000;
        /// Can be read
        const MEM_READ = 0x4000_0000;
        /// Can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One raw entry of the section table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    /// Reads a 40-byte section header.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the table is truncated.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let raw_name = reader.read_exact(MAX_SECTION_NAME_LENGTH as u32)?;
        let name_length = raw_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_SECTION_NAME_LENGTH);
        let name = String::from_utf8_lossy(&raw_name[..name_length]).into_owned();

        Ok(SectionHeader {
            name,
            virtual_size: reader.read_u32()?,
            virtual_address: reader.read_u32()?,
            size_of_raw_data: reader.read_u32()?,
            pointer_to_raw_data: reader.read_u32()?,
            pointer_to_relocations: reader.read_u32()?,
            pointer_to_line_numbers: reader.read_u32()?,
            number_of_relocations: reader.read_u16()?,
            number_of_line_numbers: reader.read_u16()?,
            characteristics: SectionFlags::from_bits_retain(reader.read_u32()?),
        })
    }

    /// Writes the 40-byte section header.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the name is longer than 8 bytes.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let name = self.name.as_bytes();
        if name.len() > MAX_SECTION_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "Section name '{}' exceeds {MAX_SECTION_NAME_LENGTH} bytes",
                self.name
            )));
        }

        let mut raw_name = [0u8; MAX_SECTION_NAME_LENGTH];
        raw_name[..name.len()].copy_from_slice(name);
        writer.write_bytes(&raw_name)?;
        writer.write_u32(self.virtual_size)?;
        writer.write_u32(self.virtual_address)?;
        writer.write_u32(self.size_of_raw_data)?;
        writer.write_u32(self.pointer_to_raw_data)?;
        writer.write_u32(self.pointer_to_relocations)?;
        writer.write_u32(self.pointer_to_line_numbers)?;
        writer.write_u16(self.number_of_relocations)?;
        writer.write_u16(self.number_of_line_numbers)?;
        writer.write_u32(self.characteristics.bits())
    }

    /// Whether `rva` falls inside the mapped extent of the section.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.virtual_size
    }

    /// Whether `offset` falls inside the raw data of the section.
    #[must_use]
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        let start = u64::from(self.pointer_to_raw_data);
        offset >= start && offset - start < u64::from(self.size_of_raw_data)
    }

    /// Translates an RVA into a file offset relative to this section. `None` for an RVA below
    /// the start of the section.
    #[must_use]
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<u64> {
        let delta = rva.checked_sub(self.virtual_address)?;
        Some(u64::from(delta) + u64::from(self.pointer_to_raw_data))
    }

    /// Translates a file offset into an RVA relative to this section. `None` for an offset
    /// below the start of the raw data.
    #[must_use]
    pub fn file_offset_to_rva(&self, offset: u64) -> Option<u32> {
        let delta = offset.checked_sub(u64::from(self.pointer_to_raw_data))?;
        #[allow(clippy::cast_possible_truncation)]
        Some(self.virtual_address.wrapping_add(delta as u32))
    }
}

/// A section of a PE file: a name, characteristics and a contents segment.
///
/// The location of a section is assigned by [`super::PeFile::update_headers`]; the section table
/// entry is derived from it with [`PeSection::create_header`].
pub struct PeSection {
    /// Section name, at most 8 bytes of UTF-8.
    pub name: String,
    /// Section characteristics.
    pub characteristics: SectionFlags,
    contents: Option<SegmentRef>,
    offsets: SegmentOffsets,
}

impl PeSection {
    /// Creates a section, placed at offset and RVA 0 until the next layout.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        characteristics: SectionFlags,
        contents: Option<SegmentRef>,
    ) -> Self {
        PeSection {
            name: name.into(),
            characteristics,
            contents,
            offsets: SegmentOffsets::default(),
        }
    }

    /// Creates a section from a section table entry and its (already read) contents.
    #[must_use]
    pub fn from_header(header: &SectionHeader, contents: Option<SegmentRef>) -> Self {
        PeSection {
            name: header.name.clone(),
            characteristics: header.characteristics,
            contents,
            offsets: SegmentOffsets::new(
                u64::from(header.pointer_to_raw_data),
                header.virtual_address,
            ),
        }
    }

    /// The contents segment, if any.
    #[must_use]
    pub fn contents(&self) -> Option<&SegmentRef> {
        self.contents.as_ref()
    }

    /// Replaces the contents. The section must be laid out again before it is written.
    pub fn set_contents(&mut self, contents: Option<SegmentRef>) {
        self.contents = contents;
    }

    /// Whether the section can be read.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.characteristics.contains(SectionFlags::MEM_READ)
    }

    /// Whether the section can be written.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.characteristics.contains(SectionFlags::MEM_WRITE)
    }

    /// Whether the section holds code.
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.characteristics.contains(SectionFlags::CONTENT_CODE)
    }

    /// Whether `rva` lies inside the mapped extent of the section.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva() && rva - self.rva() < self.virtual_size()
    }

    /// Whether `offset` lies inside the on-disk extent of the section.
    #[must_use]
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        offset >= self.offset() && offset - self.offset() < u64::from(self.physical_size())
    }

    /// Translates an RVA inside this section into a file offset, or `None` if `rva` lies
    /// before the section.
    #[must_use]
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<u64> {
        let delta = rva.checked_sub(self.rva())?;
        Some(u64::from(delta) + self.offset())
    }

    /// Translates a file offset inside this section into an RVA, or `None` if `offset` lies
    /// before the section.
    #[must_use]
    pub fn file_offset_to_rva(&self, offset: u64) -> Option<u32> {
        let delta = offset.checked_sub(self.offset())?;
        #[allow(clippy::cast_possible_truncation)]
        Some(self.rva().wrapping_add(delta as u32))
    }

    /// Builds the section table entry for the current layout.
    ///
    /// `SizeOfRawData` is the physical size rounded up to `file_alignment`; `VirtualSize` is the
    /// unaligned virtual size of the contents.
    #[must_use]
    pub fn create_header(&self, file_alignment: u32) -> SectionHeader {
        let physical_size = self.physical_size();
        let pointer_to_raw_data = u32::try_from(self.offset()).unwrap_or(u32::MAX);
        SectionHeader {
            name: self.name.clone(),
            virtual_size: self.virtual_size(),
            virtual_address: self.rva(),
            size_of_raw_data: if physical_size == 0 {
                0
            } else {
                align_up_u32(physical_size, file_alignment)
            },
            pointer_to_raw_data: if physical_size == 0 {
                0
            } else {
                pointer_to_raw_data
            },
            characteristics: self.characteristics,
            ..SectionHeader::default()
        }
    }
}

impl Segment for PeSection {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
        if let Some(contents) = &self.contents {
            contents.update_offsets(parameters);
        }
    }

    fn physical_size(&self) -> u32 {
        self.contents.as_ref().map_or(0, |c| c.physical_size())
    }

    fn virtual_size(&self) -> u32 {
        self.contents.as_ref().map_or(0, |c| c.virtual_size())
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        match &self.contents {
            Some(contents) => contents.write(writer),
            None => Ok(()),
        }
    }

    fn create_reader(&self) -> Option<BinaryStreamReader> {
        self.contents.as_ref()?.create_reader()
    }
}

impl fmt::Debug for PeSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeSection")
            .field("name", &self.name)
            .field("offset", &format_args!("0x{:X}", self.offset()))
            .field("rva", &format_args!("0x{:X}", self.rva()))
            .field("physical_size", &self.physical_size())
            .field("virtual_size", &self.virtual_size())
            .field("characteristics", &self.characteristics)
            .finish()
    }
}

impl fmt::Display for PeSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name, self.rva())
    }
}
