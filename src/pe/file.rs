use std::{path::Path, sync::Arc};

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, DataSourceRef, MemoryMappedDataSource, MemoryStreamWriter},
    pe::{
        compute_checksum, Characteristics, DataDirectory, DataDirectoryIndex, DosHeader, FileHeader, MachineType,
        MappingMode, OptionalHeader, OptionalHeaderMagic, PeSection, ReaderParameters,
        SectionHeader, CHECKSUM_FIELD_OFFSET, FILE_HEADER_SIZE, PE_SIGNATURE,
        SECTION_HEADER_SIZE,
    },
    segment::{ReaderSegment, RelocationParameters, Segment, SegmentRef, VirtualSegment},
    utils::{align_up, align_up_u32},
    Error, Result,
};

/// A PE file: headers, an ordered list of sections, and the bytes around them.
///
/// Sections are laid out by [`PeFile::update_headers`], which [`PeFile::write`] calls before
/// emitting anything. Header fields that depend on the layout (`NumberOfSections`,
/// `SizeOfHeaders`, `SizeOfImage`, section table entries and data directory RVAs) are
/// recomputed there; everything else is written as stored.
///
/// ```rust,no_run
/// use peweave::pe::PeFile;
///
/// let mut file = PeFile::from_path("program.exe")?;
/// for section in &file.sections {
///     println!("{section}");
/// }
///
/// let text = file.section_by_name(".text").expect("code section");
/// let mut reader = file.create_reader_at_rva(file.optional_header.address_of_entry_point)?;
/// let first = reader.read_u8()?;
///
/// let rebuilt = file.to_bytes()?;
/// # Ok::<(), peweave::Error>(())
/// ```
pub struct PeFile {
    /// The MS-DOS header and stub.
    pub dos_header: DosHeader,
    /// The COFF file header.
    pub file_header: FileHeader,
    /// The optional header.
    pub optional_header: OptionalHeader,
    /// Sections in file order.
    pub sections: Vec<PeSection>,
    /// Bytes between the section table and the first section, if any are non-zero.
    pub extra_section_data: Option<SegmentRef>,
    /// Bytes after the last section (overlay, appended signatures).
    pub eof_data: Option<SegmentRef>,
    mapping_mode: MappingMode,
}

impl Default for PeFile {
    fn default() -> Self {
        Self::new()
    }
}

impl PeFile {
    /// Creates an empty 32-bit file with default headers and no sections.
    #[must_use]
    pub fn new() -> Self {
        PeFile {
            dos_header: DosHeader::default(),
            file_header: FileHeader::default(),
            optional_header: OptionalHeader::default(),
            sections: Vec::new(),
            extra_section_data: None,
            eof_data: None,
            mapping_mode: MappingMode::Unmapped,
        }
    }

    /// Creates an empty file for `machine`, choosing PE32 or PE32+ accordingly.
    #[must_use]
    pub fn with_machine(machine: MachineType) -> Self {
        let mut file = Self::new();
        file.file_header.machine = machine;
        if matches!(
            machine.base_machine(),
            MachineType::Amd64 | MachineType::Arm64 | MachineType::Ia64
        ) {
            file.optional_header.magic = OptionalHeaderMagic::Pe32Plus;
            file.optional_header.image_base = 0x0001_4000_0000;
            file.file_header.characteristics.remove(Characteristics::MACHINE_32BIT);
            file.file_header.characteristics |= Characteristics::LARGE_ADDRESS_AWARE;
            file.file_header.size_of_optional_header = 0xF0;
        }
        file
    }

    /// Parses an unmapped file held in memory.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the headers are invalid.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_reader(BinaryStreamReader::from_bytes(data), &ReaderParameters::default())
    }

    /// Memory-maps and parses the file at `path`.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be mapped, or [`Error::Malformed`] if the
    /// headers are invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let source: DataSourceRef = Arc::new(MemoryMappedDataSource::new(path)?);
        Self::from_reader(BinaryStreamReader::from_source(source)?, &ReaderParameters::default())
    }

    /// Parses a file starting at the current position of `reader`.
    ///
    /// Section contents are not copied: each section refers to a window of the reader's data
    /// source, padded with zeroes up to its virtual size.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a signature or header is invalid, and whatever the
    /// configured error listener escalates for truncated sections.
    pub fn from_reader(mut reader: BinaryStreamReader, parameters: &ReaderParameters) -> Result<Self> {
        let base = reader.offset();
        let dos_header = DosHeader::from_reader(&mut reader)?;

        reader.set_offset(base + u64::from(dos_header.next_header_offset))?;
        let signature = reader.read_u32()?;
        if signature != PE_SIGNATURE {
            return Err(malformed_error!("Invalid PE signature - 0x{:08X}", signature));
        }

        let file_header = FileHeader::from_reader(&mut reader)?;
        let optional_header_offset = reader.offset();
        let optional_header = OptionalHeader::from_reader(&mut reader)?;
        reader.set_offset(
            optional_header_offset + u64::from(file_header.size_of_optional_header),
        )?;

        let mut headers = Vec::with_capacity(usize::from(file_header.number_of_sections));
        for _ in 0..file_header.number_of_sections {
            headers.push(SectionHeader::from_reader(&mut reader)?);
        }

        let section_table_end = reader.offset();
        let extra_section_data =
            read_extra_section_data(&reader, section_table_end, base, &optional_header)?;

        let mut sections = Vec::with_capacity(headers.len());
        for header in &headers {
            let contents = read_section_contents(&reader, base, header, parameters)?;
            sections.push(PeSection::from_header(header, contents));
        }

        let eof_data = match parameters.mapping_mode {
            MappingMode::Unmapped => {
                let headers_end =
                    section_table_end.max(base + u64::from(optional_header.size_of_headers));
                read_eof_data(&reader, base, headers_end, &headers)
            }
            MappingMode::Mapped => None,
        };

        tracing::debug!(
            "Parsed PE file: machine {}, {} sections, entry point 0x{:08X}",
            file_header.machine,
            sections.len(),
            optional_header.address_of_entry_point
        );

        Ok(PeFile {
            dos_header,
            file_header,
            optional_header,
            sections,
            extra_section_data,
            eof_data,
            mapping_mode: parameters.mapping_mode,
        })
    }

    /// Layout of the bytes this file was read from.
    #[must_use]
    pub fn mapping_mode(&self) -> MappingMode {
        self.mapping_mode
    }

    /// Whether the optional header is PE32.
    #[must_use]
    pub fn is_32bit(&self) -> bool {
        self.optional_header.is_32bit()
    }

    /// Finds a section by its name.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&PeSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Finds a section by its name.
    pub fn section_by_name_mut(&mut self, name: &str) -> Option<&mut PeSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    /// Appends a section. Its location is assigned by the next [`PeFile::update_headers`].
    pub fn add_section(&mut self, section: PeSection) {
        self.sections.push(section);
    }

    /// The section that maps `rva`, if any.
    #[must_use]
    pub fn try_get_section_containing_rva(&self, rva: u32) -> Option<&PeSection> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// The section that maps `rva`.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section maps `rva`, which includes every
    /// address inside the headers.
    pub fn get_section_containing_rva(&self, rva: u32) -> Result<&PeSection> {
        self.try_get_section_containing_rva(rva)
            .ok_or(Error::AddressOutOfRange(u64::from(rva)))
    }

    /// The section whose raw data contains `offset`, if any.
    #[must_use]
    pub fn try_get_section_containing_offset(&self, offset: u64) -> Option<&PeSection> {
        self.sections.iter().find(|s| s.contains_file_offset(offset))
    }

    /// The section whose raw data contains `offset`.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section covers `offset`.
    pub fn get_section_containing_offset(&self, offset: u64) -> Result<&PeSection> {
        self.try_get_section_containing_offset(offset)
            .ok_or(Error::AddressOutOfRange(offset))
    }

    /// Translates an RVA into a file offset.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section maps `rva`.
    pub fn rva_to_file_offset(&self, rva: u32) -> Result<u64> {
        self.get_section_containing_rva(rva)?
            .rva_to_file_offset(rva)
            .ok_or(Error::AddressOutOfRange(u64::from(rva)))
    }

    /// Translates a file offset into an RVA.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section covers `offset`.
    pub fn file_offset_to_rva(&self, offset: u64) -> Result<u32> {
        self.get_section_containing_offset(offset)?
            .file_offset_to_rva(offset)
            .ok_or(Error::AddressOutOfRange(offset))
    }

    /// Creates a reader positioned at `rva`, bounded by the end of its section.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section maps `rva`.
    pub fn create_reader_at_rva(&self, rva: u32) -> Result<BinaryStreamReader> {
        let section = self.get_section_containing_rva(rva)?;
        let mut reader = section
            .create_reader()
            .ok_or(Error::AddressOutOfRange(u64::from(rva)))?;
        reader.set_rva(rva)?;
        reader.fork_absolute(reader.offset())
    }

    /// Creates a reader over `size` bytes starting at `rva`.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section maps `rva`, or
    /// [`Error::EndOfStream`] if the range leaves the section.
    pub fn create_reader_at_rva_sized(&self, rva: u32, size: u32) -> Result<BinaryStreamReader> {
        let reader = self.create_reader_at_rva(rva)?;
        reader.fork_absolute_sized(reader.offset(), size)
    }

    /// Creates a reader positioned at file offset `offset`, bounded by the end of its section.
    ///
    /// # Errors
    /// Returns [`Error::AddressOutOfRange`] if no section covers `offset`.
    pub fn create_reader_at_offset(&self, offset: u64) -> Result<BinaryStreamReader> {
        let section = self.get_section_containing_offset(offset)?;
        let reader = section
            .create_reader()
            .ok_or(Error::AddressOutOfRange(offset))?;
        reader.fork_absolute(offset)
    }

    /// The data directory at `index`.
    #[must_use]
    pub fn data_directory(&self, index: DataDirectoryIndex) -> DataDirectory {
        self.optional_header.data_directory(index)
    }

    /// Replaces the data directory at `index`.
    pub fn set_data_directory(&mut self, index: DataDirectoryIndex, directory: DataDirectory) {
        self.optional_header.set_data_directory(index, directory);
    }

    /// Absolute file offset of the file header.
    #[must_use]
    pub fn file_header_offset(&self) -> u64 {
        u64::from(self.dos_header.next_header_offset) + 4
    }

    /// Absolute file offset of the optional header.
    #[must_use]
    pub fn optional_header_offset(&self) -> u64 {
        self.file_header_offset() + u64::from(FILE_HEADER_SIZE)
    }

    /// Absolute file offset of the `CheckSum` field.
    #[must_use]
    pub fn checksum_offset(&self) -> u64 {
        self.optional_header_offset() + CHECKSUM_FIELD_OFFSET
    }

    /// Offset at which the section table starts.
    fn section_table_offset(&self) -> u64 {
        self.optional_header_offset() + u64::from(self.file_header.size_of_optional_header)
    }

    /// Recomputes every header field that depends on the layout.
    ///
    /// Running it twice without changes in between yields the same values.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if there are more than 65535 sections or the
    /// alignments are invalid.
    pub fn update_headers(&mut self) -> Result<()> {
        let snapshot: Vec<(u32, u32)> = self
            .sections
            .iter()
            .map(|s| (s.rva(), s.virtual_size()))
            .collect();

        self.file_header.number_of_sections = u16::try_from(self.sections.len())
            .map_err(|_| Error::InvalidArgument("Too many sections".to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        {
            self.file_header.size_of_optional_header = self.optional_header.physical_size() as u16;
        }

        let section_table_offset = self.section_table_offset();
        let section_table_end = section_table_offset
            + u64::from(SECTION_HEADER_SIZE) * self.sections.len() as u64;

        let mut headers_end = section_table_end;
        if let Some(extra) = &self.extra_section_data {
            extra.update_offsets(&self.relocation_parameters(headers_end, 0));
            headers_end += u64::from(extra.physical_size());
        }

        self.optional_header.size_of_headers = u32::try_from(align_up(
            headers_end,
            u64::from(self.optional_header.file_alignment),
        ))
        .map_err(|_| Error::InvalidArgument("Headers exceed 4 GiB".to_string()))?;

        self.align_sections()?;

        // The certificate directory holds a file offset, not an RVA.
        for (index, directory) in self.optional_header.data_directories.iter_mut().enumerate() {
            if index == DataDirectoryIndex::Certificate as usize || !directory.is_present() {
                continue;
            }

            // Sections that were never placed have no old location to translate from.
            let old = snapshot.iter().enumerate().find(|(_, (rva, size))| {
                *rva != 0 && directory.virtual_address >= *rva && directory.virtual_address - rva < *size
            });
            if let Some((position, (old_rva, _))) = old {
                let delta = directory.virtual_address - old_rva;
                directory.virtual_address = self.sections[position].rva() + delta;
            }
        }

        let image_end = self
            .sections
            .last()
            .map_or(self.optional_header.size_of_headers, |last| {
                last.rva() + last.virtual_size()
            });
        self.optional_header.size_of_image =
            align_up_u32(image_end, self.optional_header.section_alignment);

        if let Some(eof) = &self.eof_data {
            let end = self.physical_end();
            eof.update_offsets(&self.relocation_parameters(end, 0));
        }

        tracing::trace!(
            "Updated headers: SizeOfHeaders 0x{:X}, SizeOfImage 0x{:X}",
            self.optional_header.size_of_headers,
            self.optional_header.size_of_image
        );

        Ok(())
    }

    /// Assigns file offsets and RVAs to all sections, chaining each one off the previous one.
    ///
    /// The first section starts at `SizeOfHeaders`, mapped at `SizeOfHeaders` rounded up to
    /// `SectionAlignment`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if an alignment is zero.
    pub fn align_sections(&mut self) -> Result<()> {
        let file_alignment = self.optional_header.file_alignment;
        let section_alignment = self.optional_header.section_alignment;
        if file_alignment == 0 || section_alignment == 0 {
            return Err(Error::InvalidArgument(format!(
                "Invalid alignment - file 0x{file_alignment:X}, section 0x{section_alignment:X}"
            )));
        }

        let mut offset = u64::from(self.optional_header.size_of_headers);
        let mut rva = align_up_u32(self.optional_header.size_of_headers, section_alignment);

        for section in &self.sections {
            offset = align_up(offset, u64::from(file_alignment));
            rva = align_up_u32(rva, section_alignment);

            section.update_offsets(&self.relocation_parameters(offset, rva));

            offset += u64::from(align_up_u32(section.physical_size(), file_alignment));
            rva += section.virtual_size();
        }

        Ok(())
    }

    fn relocation_parameters(&self, offset: u64, rva: u32) -> RelocationParameters {
        RelocationParameters::with_image(
            self.optional_header.image_base,
            offset,
            rva,
            self.is_32bit(),
        )
    }

    /// File offset just past the raw data of the last section (or the headers).
    fn physical_end(&self) -> u64 {
        let file_alignment = u64::from(self.optional_header.file_alignment);
        self.sections
            .iter()
            .filter(|s| s.physical_size() > 0)
            .map(|s| s.offset() + align_up(u64::from(s.physical_size()), file_alignment))
            .max()
            .unwrap_or(u64::from(self.optional_header.size_of_headers))
    }

    /// Lays out the file and writes it to `writer`.
    ///
    /// # Errors
    /// Returns an error if the layout is invalid or the writer fails.
    pub fn write(&mut self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        self.update_headers()?;

        let start = writer.offset();
        let file_alignment = self.optional_header.file_alignment;

        self.dos_header.write(writer)?;
        writer.write_u32(PE_SIGNATURE)?;
        self.file_header.write(writer)?;
        self.optional_header.write(writer)?;

        for section in &self.sections {
            section.create_header(file_alignment).write(writer)?;
        }

        if let Some(extra) = &self.extra_section_data {
            extra.write(writer)?;
        }

        pad_to(writer, start + u64::from(self.optional_header.size_of_headers))?;

        for section in &self.sections {
            if section.physical_size() == 0 {
                continue;
            }

            pad_to(writer, start + section.offset())?;
            section.write(writer)?;
            let end = section.offset() + u64::from(align_up_u32(section.physical_size(), file_alignment));
            pad_to(writer, start + end)?;
        }

        if let Some(eof) = &self.eof_data {
            eof.write(writer)?;
        }

        Ok(())
    }

    /// Lays out the file and returns its bytes.
    ///
    /// # Errors
    /// Returns an error if the layout is invalid.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut writer = MemoryStreamWriter::new();
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Lays out the file, stores the image checksum in the optional header, and returns the
    /// final bytes.
    ///
    /// # Errors
    /// Returns an error if the layout is invalid.
    pub fn to_bytes_with_checksum(&mut self) -> Result<Vec<u8>> {
        let mut bytes = self.to_bytes()?;
        let offset = usize::try_from(self.checksum_offset())
            .map_err(|_| Error::Error("Checksum offset out of range".to_string()))?;
        let checksum = compute_checksum(&bytes, offset);

        self.optional_header.checksum = checksum;
        bytes
            .get_mut(offset..offset + 4)
            .ok_or(Error::AddressOutOfRange(offset as u64))?
            .copy_from_slice(&checksum.to_le_bytes());
        Ok(bytes)
    }
}

impl std::fmt::Debug for PeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeFile")
            .field("machine", &self.file_header.machine)
            .field("magic", &self.optional_header.magic)
            .field("sections", &self.sections)
            .field("mapping_mode", &self.mapping_mode)
            .finish_non_exhaustive()
    }
}

fn pad_to(writer: &mut dyn BinaryStreamWriter, target: u64) -> Result<()> {
    let current = writer.offset();
    if current > target {
        return Err(Error::Error(format!(
            "Layout overlap: writer at 0x{current:X} is past 0x{target:X}"
        )));
    }
    writer.write_zeroes(target - current)
}

fn read_extra_section_data(
    reader: &BinaryStreamReader,
    section_table_end: u64,
    base: u64,
    optional_header: &OptionalHeader,
) -> Result<Option<SegmentRef>> {
    let headers_end = (base + u64::from(optional_header.size_of_headers)).min(reader.end_offset());
    if headers_end <= section_table_end {
        return Ok(None);
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut extra = reader.fork_absolute_sized(section_table_end, (headers_end - section_table_end) as u32)?;
    let bytes = extra.fork().read_to_end();
    if bytes.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    Ok(Some(Arc::new(extra.read_segment(extra.remaining())?)))
}

fn read_section_contents(
    reader: &BinaryStreamReader,
    base: u64,
    header: &SectionHeader,
    parameters: &ReaderParameters,
) -> Result<Option<SegmentRef>> {
    let (start, requested) = match parameters.mapping_mode {
        MappingMode::Unmapped => (u64::from(header.pointer_to_raw_data), header.size_of_raw_data),
        MappingMode::Mapped => (u64::from(header.virtual_address), header.virtual_size),
    };
    let virtual_size = if header.virtual_size == 0 {
        header.size_of_raw_data
    } else {
        header.virtual_size
    };

    if requested == 0 {
        return Ok(Some(Arc::new(VirtualSegment::new(None, virtual_size))));
    }

    let absolute = base + start;
    let available = reader.end_offset().saturating_sub(absolute);
    let size = if u64::from(requested) > available {
        parameters.error_listener.bad_image(&format!(
            "Section {} extends beyond the end of the file (0x{:X} bytes requested, 0x{:X} available)",
            header.name, requested, available
        ))?;
        #[allow(clippy::cast_possible_truncation)]
        let available = available as u32;
        available
    } else {
        requested
    };

    let window = BinaryStreamReader::new(reader.source().clone(), absolute, header.virtual_address, size)?;
    let physical: SegmentRef = if parameters.eager_sections {
        let mut window = window;
        Arc::new(window.read_segment(size)?)
    } else {
        Arc::new(ReaderSegment::new(window))
    };

    let contents: SegmentRef = Arc::new(VirtualSegment::new(Some(physical), virtual_size));
    if parameters.mapping_mode == MappingMode::Mapped {
        contents.update_offsets(&RelocationParameters::new(
            u64::from(header.pointer_to_raw_data),
            header.virtual_address,
        ));
    }

    Ok(Some(contents))
}

fn read_eof_data(
    reader: &BinaryStreamReader,
    base: u64,
    headers_end: u64,
    headers: &[SectionHeader],
) -> Option<SegmentRef> {
    let sections_end = headers
        .iter()
        .filter(|h| h.size_of_raw_data > 0)
        .map(|h| base + u64::from(h.pointer_to_raw_data) + u64::from(h.size_of_raw_data))
        .max()
        .unwrap_or(headers_end);

    if sections_end >= reader.end_offset() {
        return None;
    }

    let eof = reader.fork_absolute(sections_end).ok()?;
    Some(Arc::new(ReaderSegment::new(eof)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::DiagnosticsErrorListener,
        pe::SectionFlags,
        segment::DataSegment,
        test::factories::pe::{build_sample_file, sample_file_bytes},
    };

    #[test]
    fn parse_sample() {
        let file = PeFile::from_bytes(sample_file_bytes()).unwrap();
        assert_eq!(file.file_header.machine, MachineType::I386);
        assert_eq!(file.sections.len(), 2);
        assert_eq!(file.sections[0].name, ".text");
        assert_eq!(file.sections[0].rva(), 0x2000);
        assert_eq!(file.sections[0].offset(), 0x200);
        assert_eq!(file.sections[1].name, ".data");
        assert!(file.eof_data.is_none());
    }

    #[test]
    fn bad_signature() {
        let mut bytes = sample_file_bytes();
        bytes[0x80] = b'X';
        assert!(matches!(PeFile::from_bytes(bytes), Err(Error::Malformed { .. })));
    }

    #[test]
    fn header_addresses_do_not_translate() {
        let file = PeFile::from_bytes(sample_file_bytes()).unwrap();
        assert!(matches!(
            file.rva_to_file_offset(0x100),
            Err(Error::AddressOutOfRange(0x100))
        ));
        assert!(file.file_offset_to_rva(0x10).is_err());
        assert_eq!(file.rva_to_file_offset(0x2010).unwrap(), 0x210);
        assert_eq!(file.file_offset_to_rva(0x210).unwrap(), 0x2010);
    }

    #[test]
    fn reader_at_rva() {
        let file = PeFile::from_bytes(sample_file_bytes()).unwrap();
        let mut reader = file.create_reader_at_rva(0x2001).unwrap();
        assert_eq!(reader.rva(), 0x2001);
        assert_eq!(reader.offset(), 0x201);
        assert_eq!(reader.read_u8().unwrap(), 0x01);

        let reader = file.create_reader_at_rva_sized(0x2000, 4).unwrap();
        assert_eq!(reader.length(), 4);

        let mut reader = file.create_reader_at_offset(0x400).unwrap();
        assert_eq!(reader.rva(), 0x4000);
        assert_eq!(reader.read_u8().unwrap(), 0xDA);
    }

    #[test]
    fn virtual_tail_reads_zero() {
        let file = PeFile::from_bytes(sample_file_bytes()).unwrap();
        let data = file.section_by_name(".data").unwrap();
        assert_eq!(data.virtual_size(), 0x300);

        let mut reader = file.create_reader_at_rva(0x4250).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 0);
    }

    #[test]
    fn update_headers_is_idempotent() {
        let mut file = PeFile::from_bytes(sample_file_bytes()).unwrap();
        file.update_headers().unwrap();
        let first = (file.optional_header.clone(), file.file_header.clone());
        file.update_headers().unwrap();
        assert_eq!(first, (file.optional_header.clone(), file.file_header.clone()));
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let original = sample_file_bytes();
        let mut file = PeFile::from_bytes(original.clone()).unwrap();
        assert_eq!(file.to_bytes().unwrap(), original);
    }

    #[test]
    fn adding_section_shifts_directories() {
        let mut file = build_sample_file();
        file.set_data_directory(DataDirectoryIndex::Import, DataDirectory::new(0x4010, 0x28));
        file.update_headers().unwrap();

        let grown = vec![0x90; 0x2100];
        file.sections[0].set_contents(Some(Arc::new(DataSegment::new(grown))));
        file.update_headers().unwrap();

        let data = file.section_by_name(".data").unwrap();
        assert_eq!(data.rva(), 0x6000);
        assert_eq!(data.offset(), 0x2400);
        assert_eq!(
            file.data_directory(DataDirectoryIndex::Import),
            DataDirectory::new(0x6010, 0x28)
        );
        assert_eq!(file.optional_header.size_of_image, 0x8000);
    }

    #[test]
    fn new_section_is_appended() {
        let mut file = build_sample_file();
        file.add_section(PeSection::new(
            ".rsrc",
            SectionFlags::CONTENT_INITIALIZED_DATA | SectionFlags::MEM_READ,
            Some(Arc::new(DataSegment::new(vec![1; 0x10]))),
        ));

        let bytes = file.to_bytes().unwrap();
        let parsed = PeFile::from_bytes(bytes).unwrap();
        let rsrc = parsed.section_by_name(".rsrc").unwrap();
        assert_eq!(rsrc.rva(), 0x6000);
        assert_eq!(parsed.file_header.number_of_sections, 3);
    }

    #[test]
    fn eof_data_preserved() {
        let mut bytes = sample_file_bytes();
        bytes.extend_from_slice(b"overlay");
        let mut file = PeFile::from_bytes(bytes.clone()).unwrap();
        assert!(file.eof_data.is_some());
        assert_eq!(file.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn truncated_section_is_reported() {
        let mut bytes = sample_file_bytes();
        bytes.truncate(0x500);

        assert!(PeFile::from_bytes(bytes.clone()).is_err());

        let listener = Arc::new(DiagnosticsErrorListener::new());
        let parameters = ReaderParameters::with_diagnostics(listener.clone());
        let file = PeFile::from_reader(BinaryStreamReader::from_bytes(bytes), &parameters).unwrap();
        assert_eq!(listener.diagnostics().count(), 1);
        assert_eq!(file.section_by_name(".data").unwrap().physical_size(), 0x100);
    }

    #[test]
    fn checksum_written() {
        let mut file = build_sample_file();
        let bytes = file.to_bytes_with_checksum().unwrap();
        let offset = usize::try_from(file.checksum_offset()).unwrap();
        let stored = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        assert_eq!(stored, file.optional_header.checksum);
        assert_eq!(stored, compute_checksum(&bytes, offset));
    }

    #[test]
    fn pe32_plus_machine() {
        let mut file = PeFile::with_machine(MachineType::Amd64);
        assert!(!file.is_32bit());
        let bytes = file.to_bytes().unwrap();
        let parsed = PeFile::from_bytes(bytes).unwrap();
        assert_eq!(parsed.optional_header.magic, OptionalHeaderMagic::Pe32Plus);
        assert_eq!(parsed.file_header.size_of_optional_header, 0xF0);
    }
}
