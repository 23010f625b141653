//! Turning a [`PeImage`] back into a [`PeFile`].
//!
//! A build runs through the same stages for every image:
//!
//! 1. the directory buffers (imports, exports, debug, resources, relocations and the CLR data)
//!    are created from the image,
//! 2. the buffers are arranged into sections,
//! 3. the sections are laid out and the data directories are pointed at the buffers,
//! 4. the remaining header fields are computed.
//!
//! [`BuilderKind`] selects how the sections are arranged. A managed build discards the
//! original layout entirely, which is what IL-only images want. An unmanaged build keeps the
//! original sections so that native code keeps working, and appends whatever no longer fits.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peweave::{builder::PeFileBuilder, image::PeImage};
//!
//! let image = PeImage::from_path("app.exe")?;
//! let mut file = PeFileBuilder::managed().create_file(&image)?;
//! std::fs::write("app.rebuilt.exe", file.to_bytes()?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod context;
mod debug;
mod dotnet;
mod exports;
mod imports;
mod managed;
mod platform;
mod relocations;
mod resources;
mod unmanaged;

pub use config::{BuilderConfig, DEFAULT_FILE_ALIGNMENT, DEFAULT_SECTION_ALIGNMENT};
pub use debug::DebugDirectoryBuffer;
pub use dotnet::{
    collect_field_data, collect_method_bodies, DotNetSegmentBuffer, PlacedFieldData,
    PlacedMethodBody,
};
pub use exports::ExportDirectoryBuffer;
pub use imports::ImportDirectoryBuffer;
pub use platform::{Platform, ThunkStub};
pub use relocations::RelocationDirectoryBuffer;
pub use resources::ResourceDirectoryBuffer;

use strum::Display;

use crate::{
    image::PeImage,
    pe::{PeFile, SectionFlags, DEFAULT_NUMBER_OF_RVA_AND_SIZES},
    segment::Segment,
    Error, Result,
};

use context::BuilderContext;

/// Module exporting the CLR entry points.
pub(crate) const MSCOREE: &str = "mscoree.dll";

/// `_CorDllMain` for libraries, `_CorExeMain` otherwise.
pub(crate) fn clr_entry_point_name(image: &PeImage) -> &'static str {
    if image.is_dll() {
        "_CorDllMain"
    } else {
        "_CorExeMain"
    }
}

/// How the sections of the output file are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum BuilderKind {
    /// Synthesizes `.text`, `.sdata`, `.rsrc` and `.reloc` from scratch.
    #[default]
    Managed,
    /// Keeps the original sections and appends auxiliary ones.
    Unmanaged,
}

/// Builds PE files from images.
#[derive(Debug, Clone, Default)]
pub struct PeFileBuilder {
    kind: BuilderKind,
    config: BuilderConfig,
}

impl PeFileBuilder {
    /// A builder that rebuilds the whole file.
    #[must_use]
    pub fn managed() -> Self {
        Self::new(BuilderKind::Managed)
    }

    /// A builder that preserves the original sections.
    #[must_use]
    pub fn unmanaged() -> Self {
        Self::new(BuilderKind::Unmanaged)
    }

    /// A builder of the given kind with the default configuration.
    #[must_use]
    pub fn new(kind: BuilderKind) -> Self {
        PeFileBuilder {
            kind,
            config: BuilderConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    /// The kind of build.
    #[must_use]
    pub fn kind(&self) -> BuilderKind {
        self.kind
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Builds a file from `image`.
    ///
    /// The returned file is laid out; [`PeFile::to_bytes`] serializes it.
    ///
    /// # Errors
    /// - [`Error::NotSupported`] for machines without a known bootstrapper.
    /// - [`Error::InvalidArgument`] if the section alignment is smaller than the file alignment.
    /// - Whatever the configured error listener escalates, such as native method bodies that
    ///   cannot be moved.
    pub fn create_file(&self, image: &PeImage) -> Result<PeFile> {
        let (file_alignment, section_alignment) = self.alignments(image)?;

        let mut context = BuilderContext::new(image)?;
        match self.kind {
            BuilderKind::Managed => managed::populate(&mut context, image, &self.config)?,
            BuilderKind::Unmanaged => unmanaged::populate(&mut context, image, &self.config)?,
        }
        tracing::debug!(kind = %self.kind, platform = %context.platform, "created directory buffers");

        let mut file = PeFile::with_machine(image.machine_type);
        file.optional_header.magic = image.pe_kind;
        file.optional_header.image_base = image.image_base;
        file.optional_header.file_alignment = file_alignment;
        file.optional_header.section_alignment = section_alignment;

        let placed = match self.kind {
            BuilderKind::Managed => {
                managed::create_sections(&context, &mut file);
                None
            }
            BuilderKind::Unmanaged => Some(unmanaged::create_sections(&context, image, &mut file)?),
        };
        file.update_headers()?;

        let entry_point = match &placed {
            None => {
                managed::assign_data_directories(&context, &mut file);
                managed::entry_point(&context)
            }
            Some(placed) => {
                unmanaged::assign_data_directories(&context, placed, &mut file);
                unmanaged::entry_point(&context, image, placed, &file)
            }
        };
        compute_header_fields(&mut file, image, &self.config, entry_point);

        if self.config.compute_checksum {
            file.to_bytes_with_checksum()?;
        }

        tracing::debug!(
            sections = file.sections.len(),
            size_of_image = file.optional_header.size_of_image,
            entry_point,
            "built file"
        );
        Ok(file)
    }

    /// File and section alignment: configured, else the original file's, else the defaults.
    fn alignments(&self, image: &PeImage) -> Result<(u32, u32)> {
        let original = image
            .file()
            .map(|file| (file.optional_header.file_alignment, file.optional_header.section_alignment));

        let file_alignment = self
            .config
            .file_alignment
            .or(original.map(|(file, _)| file))
            .unwrap_or(DEFAULT_FILE_ALIGNMENT);
        let section_alignment = self
            .config
            .section_alignment
            .or(original.map(|(_, section)| section))
            .unwrap_or(DEFAULT_SECTION_ALIGNMENT);

        if section_alignment < file_alignment {
            return Err(Error::InvalidArgument(format!(
                "File alignment 0x{file_alignment:X} cannot be larger than the section alignment 0x{section_alignment:X}"
            )));
        }
        Ok((file_alignment, section_alignment))
    }
}

/// Fills in the header fields that do not depend on the arrangement of the sections.
fn compute_header_fields(file: &mut PeFile, image: &PeImage, config: &BuilderConfig, entry_point: u32) {
    let mut size_of_code = 0;
    let mut size_of_initialized_data = 0;
    let mut size_of_uninitialized_data = 0;
    for section in &file.sections {
        let size = section.physical_size();
        if section.characteristics.contains(SectionFlags::CONTENT_CODE) {
            size_of_code += size;
        }
        if section.characteristics.contains(SectionFlags::CONTENT_INITIALIZED_DATA) {
            size_of_initialized_data += size;
        }
        if section.characteristics.contains(SectionFlags::CONTENT_UNINITIALIZED_DATA) {
            size_of_uninitialized_data += size;
        }
    }

    let first_rva = |flags: SectionFlags| {
        file.sections
            .iter()
            .find(|section| section.characteristics.contains(flags))
            .map_or(0, |section| section.rva())
    };
    let base_of_code = first_rva(SectionFlags::CONTENT_CODE);
    let base_of_data = first_rva(SectionFlags::CONTENT_INITIALIZED_DATA);

    let header = &mut file.optional_header;
    header.magic = image.pe_kind;
    header.major_linker_version = 0x30;
    header.minor_linker_version = 0;
    header.size_of_code = size_of_code;
    header.size_of_initialized_data = size_of_initialized_data;
    header.size_of_uninitialized_data = size_of_uninitialized_data;
    header.address_of_entry_point = entry_point;
    header.base_of_code = base_of_code;
    header.base_of_data = base_of_data;
    (header.major_operating_system_version, header.minor_operating_system_version) =
        config.operating_system_version;
    header.major_image_version = 0;
    header.minor_image_version = 0;
    (header.major_subsystem_version, header.minor_subsystem_version) = config.subsystem_version;
    header.win32_version_value = 0;
    header.checksum = 0;
    header.subsystem = image.subsystem;
    header.dll_characteristics = image.dll_characteristics;
    header.size_of_stack_reserve = config.size_of_stack_reserve;
    header.size_of_stack_commit = config.size_of_stack_commit;
    header.size_of_heap_reserve = config.size_of_heap_reserve;
    header.size_of_heap_commit = config.size_of_heap_commit;
    header.loader_flags = 0;
    #[allow(clippy::cast_possible_truncation)]
    {
        header.number_of_rva_and_sizes = DEFAULT_NUMBER_OF_RVA_AND_SIZES as u32;
    }

    let file_header = &mut file.file_header;
    file_header.machine = image.machine_type;
    file_header.time_date_stamp = image.time_date_stamp;
    file_header.pointer_to_symbol_table = 0;
    file_header.number_of_symbols = 0;
    file_header.characteristics = image.characteristics;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        diagnostics::DiagnosticsErrorListener,
        image::{ExportAddress, ExportDirectory, ExportedSymbol, RelocationType},
        metadata::{tablestream::columns, TableIndex},
        pe::{compute_checksum, DataDirectoryIndex},
        segment::{DataSegment, SegmentRef, SegmentReference},
        test::factories::image::{build_dotnet_file, layout, DotNetFileOptions, SECTION_RVA, TINY_BODY},
    };

    fn image(options: &DotNetFileOptions) -> PeImage {
        PeImage::from_file(build_dotnet_file(options))
    }

    fn rebuild(builder: &PeFileBuilder, image: &PeImage) -> (PeFile, PeImage) {
        let mut file = builder.create_file(image).unwrap();
        let rebuilt = PeImage::from_bytes(file.to_bytes().unwrap()).unwrap();
        (file, rebuilt)
    }

    fn section_names(file: &PeFile) -> Vec<&str> {
        file.sections.iter().map(|section| section.name.as_str()).collect()
    }

    fn method_rva(image: &PeImage, rid: u32) -> u32 {
        let dotnet = image.dotnet().unwrap().unwrap();
        let tables = dotnet.metadata.as_ref().unwrap().tables().unwrap().unwrap();
        tables
            .read_column(TableIndex::MethodDef, rid, columns::METHOD_DEF_RVA)
            .unwrap()
    }

    fn field_rva(image: &PeImage, rid: u32) -> u32 {
        let dotnet = image.dotnet().unwrap().unwrap();
        let tables = dotnet.metadata.as_ref().unwrap().tables().unwrap().unwrap();
        tables
            .read_column(TableIndex::FieldRva, rid, columns::FIELD_RVA_RVA)
            .unwrap()
    }

    fn read_at(image: &PeImage, rva: u32, count: usize) -> Vec<u8> {
        let mut reader = image.file().unwrap().create_reader_at_rva(rva).unwrap();
        (0..count).map(|_| reader.read_u8().unwrap()).collect()
    }

    #[test]
    fn managed_i386_gets_bootstrapper() {
        let source = image(&DotNetFileOptions::default());
        let (file, rebuilt) = rebuild(&PeFileBuilder::managed(), &source);

        assert_eq!(section_names(&file), vec![".text", ".reloc"]);

        let imports = rebuilt.imports().unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].name, MSCOREE);
        assert!(imports[0].symbol("_CorExeMain").is_some());

        let text = &file.sections[0];
        let entry_point = file.optional_header.address_of_entry_point;
        assert!(text.contains_rva(entry_point));

        let iat = file.data_directory(DataDirectoryIndex::Iat);
        assert_eq!(iat.virtual_address, text.rva());
        let mut reader = rebuilt.file().unwrap().create_reader_at_rva(entry_point).unwrap();
        assert_eq!(
            Platform::I386.extract_thunk_address(file.optional_header.image_base, &mut reader),
            Some(iat.virtual_address)
        );

        let relocations = rebuilt.relocations().unwrap();
        assert_eq!(relocations.len(), 1);
        assert_eq!(relocations[0].kind, RelocationType::HighLow);
        assert_eq!(relocations[0].location.rva(), entry_point + 2);
    }

    #[test]
    fn managed_bodies_and_fields_follow_metadata() {
        let source = image(&DotNetFileOptions::default());
        let (_, rebuilt) = rebuild(&PeFileBuilder::managed(), &source);

        let tiny = method_rva(&rebuilt, 1);
        assert_ne!(tiny, SECTION_RVA + layout::TINY_BODY);
        assert_eq!(read_at(&rebuilt, tiny, TINY_BODY.len()), TINY_BODY.to_vec());

        let fat = method_rva(&rebuilt, 2);
        assert_eq!(fat % 4, 0);
        assert_eq!(read_at(&rebuilt, fat, 2), vec![0x03, 0x30]);

        assert_eq!(read_at(&rebuilt, field_rva(&rebuilt, 1), 4), vec![0x78, 0x56, 0x34, 0x12]);
        let packed = field_rva(&rebuilt, 3);
        assert_eq!(packed % 4, 0);
        assert_eq!(read_at(&rebuilt, packed, 12), (1..=12).collect::<Vec<u8>>());

        let dotnet = rebuilt.dotnet().unwrap().unwrap();
        assert!(dotnet.is_il_only());
        assert_eq!(dotnet.entry_point, 0x0600_0001);
    }

    #[test]
    fn amd64_il_only_has_no_bootstrapper() {
        let source = image(&DotNetFileOptions {
            is_32bit: false,
            ..DotNetFileOptions::default()
        });
        let (file, rebuilt) = rebuild(&PeFileBuilder::managed(), &source);

        assert_eq!(section_names(&file), vec![".text"]);
        assert_eq!(file.optional_header.address_of_entry_point, 0);
        assert!(!file.data_directory(DataDirectoryIndex::Import).is_present());
        assert!(!file.data_directory(DataDirectoryIndex::BaseRelocation).is_present());
        assert!(rebuilt.imports().unwrap().is_empty());
        assert!(rebuilt.dotnet().unwrap().is_some());
    }

    #[test]
    fn amd64_mixed_mode_needs_bootstrapper() {
        let source = image(&DotNetFileOptions {
            is_32bit: false,
            il_only: false,
            ..DotNetFileOptions::default()
        });
        let (file, rebuilt) = rebuild(&PeFileBuilder::managed(), &source);

        assert_eq!(section_names(&file), vec![".text", ".reloc"]);
        assert_ne!(file.optional_header.address_of_entry_point, 0);

        let relocations = rebuilt.relocations().unwrap();
        assert_eq!(relocations.len(), 1);
        assert_eq!(relocations[0].kind, RelocationType::Dir64);
        assert_eq!(
            relocations[0].location.rva(),
            file.optional_header.address_of_entry_point + 2
        );
    }

    #[test]
    fn native_bodies_follow_listener_policy() {
        let options = DotNetFileOptions {
            native_method: true,
            ..DotNetFileOptions::default()
        };
        assert!(PeFileBuilder::managed().create_file(&image(&options)).is_err());

        let listener = Arc::new(DiagnosticsErrorListener::new());
        let builder =
            PeFileBuilder::managed().with_config(BuilderConfig::with_diagnostics(listener.clone()));
        let (_, rebuilt) = rebuild(&builder, &image(&options));
        assert_eq!(listener.diagnostics().count(), 1);

        // The native body was skipped, its row keeps the old RVA.
        assert_eq!(method_rva(&rebuilt, 2), SECTION_RVA + layout::FAT_BODY);
    }

    #[test]
    fn header_fields() {
        let source = image(&DotNetFileOptions::default());
        let file = PeFileBuilder::managed().create_file(&source).unwrap();
        let header = &file.optional_header;

        assert_eq!(header.major_linker_version, 0x30);
        assert_eq!(header.minor_linker_version, 0);
        assert_eq!(
            (header.major_operating_system_version, header.minor_operating_system_version),
            (4, 0)
        );
        assert_eq!((header.major_subsystem_version, header.minor_subsystem_version), (4, 0));
        assert_eq!(header.size_of_stack_reserve, 0x0010_0000);
        assert_eq!(header.size_of_heap_commit, 0x1000);
        assert_eq!(header.size_of_image % header.section_alignment, 0);
        assert_eq!(header.base_of_code, file.sections[0].rva());
        assert_eq!(header.base_of_data, file.sections[1].rva());
        assert_eq!(header.size_of_code, file.sections[0].physical_size());
        assert_eq!(header.checksum, 0);
        assert_eq!(header.number_of_rva_and_sizes, 16);
        assert_eq!(file.file_header.machine, source.machine_type);
        assert_eq!(file.file_header.characteristics, source.characteristics);
    }

    #[test]
    fn checksum_is_computed_when_configured() {
        let source = image(&DotNetFileOptions::default());
        let builder = PeFileBuilder::managed().with_config(BuilderConfig::default().with_checksum());
        let mut file = builder.create_file(&source).unwrap();

        let checksum = file.optional_header.checksum;
        assert_ne!(checksum, 0);

        let bytes = file.to_bytes().unwrap();
        let offset = file.checksum_offset() as usize;
        assert_eq!(compute_checksum(&bytes, offset), checksum);
    }

    #[test]
    fn rejects_file_alignment_above_section_alignment() {
        let source = image(&DotNetFileOptions::default());
        let builder = PeFileBuilder::managed()
            .with_config(BuilderConfig::default().with_alignments(0x1000, 0x200));
        assert!(matches!(
            builder.create_file(&source),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn configured_alignments_win() {
        let source = image(&DotNetFileOptions::default());
        let builder = PeFileBuilder::managed()
            .with_config(BuilderConfig::default().with_alignments(0x1000, 0x1000));
        let file = builder.create_file(&source).unwrap();
        assert_eq!(file.optional_header.file_alignment, 0x1000);
        assert_eq!(file.sections[0].offset() % 0x1000, 0);
        assert_eq!(file.sections[0].rva() % 0x1000, 0);
    }

    #[test]
    fn exported_segments_are_placed() {
        let mut source = image(&DotNetFileOptions::default());
        let code: SegmentRef = Arc::new(DataSegment::new(vec![0xC3]));
        let mut exports = ExportDirectory::new("sample.dll");
        exports.entries.push(ExportedSymbol::new(
            "Run",
            ExportAddress::Segment(SegmentReference::new(Arc::clone(&code))),
        ));
        source.set_exports(Some(exports));

        let (file, rebuilt) = rebuild(&PeFileBuilder::managed(), &source);
        assert_eq!(section_names(&file), vec![".text", ".sdata", ".reloc"]);
        assert!(file.sections[0].contains_rva(code.rva()));

        let exports = rebuilt.exports().unwrap().unwrap();
        assert_eq!(exports.name, "sample.dll");
        assert_eq!(exports.entry("Run").unwrap().address.rva(), code.rva());
        assert!(file.sections[1].contains_rva(file.data_directory(DataDirectoryIndex::Export).virtual_address));
    }

    #[test]
    fn unmanaged_keeps_original_sections() {
        let options = DotNetFileOptions {
            is_32bit: false,
            ..DotNetFileOptions::default()
        };
        let source = image(&options);
        let (file, rebuilt) = rebuild(&PeFileBuilder::unmanaged(), &source);

        assert_eq!(section_names(&file), vec![".text", ".auxtext"]);
        assert_eq!(file.sections[0].rva(), SECTION_RVA);

        // The COR20 header fits over the old one; the metadata moves.
        let clr = file.data_directory(DataDirectoryIndex::Clr);
        assert_eq!(clr.virtual_address, SECTION_RVA);
        let dotnet = rebuilt.dotnet().unwrap().unwrap();
        assert!(dotnet.metadata.is_some());

        // Bodies that were not replaced stay where they were.
        assert_eq!(method_rva(&rebuilt, 1), SECTION_RVA + layout::TINY_BODY);
        assert_eq!(read_at(&rebuilt, method_rva(&rebuilt, 1), 3), TINY_BODY.to_vec());
        assert_eq!(field_rva(&rebuilt, 1), SECTION_RVA + layout::FIELD_DATA);
    }

    #[test]
    fn unmanaged_moves_replaced_bodies() {
        let options = DotNetFileOptions {
            is_32bit: false,
            ..DotNetFileOptions::default()
        };
        let mut source = image(&options);
        let replacement: SegmentRef = Arc::new(DataSegment::new(vec![0x06, 0x2A]));
        source
            .dotnet_mut()
            .unwrap()
            .as_mut()
            .unwrap()
            .method_bodies
            .insert(1, replacement);

        let (file, rebuilt) = rebuild(&PeFileBuilder::unmanaged(), &source);
        let moved = method_rva(&rebuilt, 1);
        assert!(file.sections[1].contains_rva(moved));
        assert_eq!(read_at(&rebuilt, moved, 2), vec![0x06, 0x2A]);
        assert_eq!(method_rva(&rebuilt, 2), SECTION_RVA + layout::FAT_BODY);
    }

    #[test]
    fn unmanaged_i386_without_entry_point_is_reported() {
        let source = image(&DotNetFileOptions::default());
        assert!(PeFileBuilder::unmanaged().create_file(&source).is_err());

        let listener = Arc::new(DiagnosticsErrorListener::new());
        let builder =
            PeFileBuilder::unmanaged().with_config(BuilderConfig::with_diagnostics(listener.clone()));
        let file = builder.create_file(&source).unwrap();
        assert_eq!(listener.diagnostics().count(), 1);
        assert_eq!(file.optional_header.address_of_entry_point, 0);
    }
}
