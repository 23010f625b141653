//! Rebuilds an image around its original sections.
//!
//! Native code cannot be relocated safely, so the sections of the original file are copied as
//! they are. Rebuilt directories are written over their original location when they still fit
//! there; everything else goes into sections appended after the copies:
//!
//! ```text
//! (original sections)
//! .auxtext  COR20 header, CLR data, debug directory, bootstrapper, exported segments
//! .sdata    export directory
//! .auxrsrc  Win32 resources
//! .reloc    base relocations
//! ```

use std::sync::Arc;

use crate::{
    image::{directory_of, find_import_address, PeImage},
    pe::{DataDirectory, DataDirectoryIndex, PeFile, PeSection, SectionFlags, DEFAULT_NUMBER_OF_RVA_AND_SIZES},
    segment::{
        DataSegment, Patch, PatchedSegment, ReaderSegment, RelocationParameters, Segment,
        SegmentBuilder, SegmentRef, VirtualAddress, VirtualSegment,
    },
    Result,
};

use super::{clr_entry_point_name, config::BuilderConfig, context::BuilderContext, MSCOREE};

/// Alignment of the directories inside `.auxtext`.
const AUX_ALIGNMENT: u32 = 4;

/// Fills the directory buffers of `context`.
pub(super) fn populate(context: &mut BuilderContext, image: &PeImage, config: &BuilderConfig) -> Result<()> {
    context.add_dotnet(image, config, true)?;
    context.add_exports(image)?;
    context.add_debug_data(image)?;
    context.add_resources(image)?;
    context.relocations = image.relocations()?.to_vec();

    if let (Some(file), Some(directory)) = (image.file(), image.dotnet()?) {
        let required = context.platform.is_clr_bootstrapper_required() || !directory.is_il_only();
        if required && file.optional_header.address_of_entry_point == 0 {
            let entry_point = clr_entry_point_name(image);
            match find_import_address(file, MSCOREE, entry_point)? {
                Some(slot) => {
                    context.bootstrapper =
                        Some(context.platform.create_thunk_stub(Arc::new(VirtualAddress(slot))));
                }
                None => config.error_listener.report_not_supported(&format!(
                    "Image has no entry point and does not import {MSCOREE}!{entry_point}"
                ))?,
            }
        }
    }

    context.seal_relocations();
    Ok(())
}

/// Copies of the original sections, with the patches that overwrite parts of them.
struct ClonedSections<'a> {
    file: Option<&'a PeFile>,
    image_base: u64,
    is_32bit: bool,
    sections: Vec<PeSection>,
    patches: Vec<Vec<Patch>>,
    /// Original `(rva, virtual size)` of every copy.
    original: Vec<(u32, u32)>,
}

impl<'a> ClonedSections<'a> {
    fn new(file: Option<&'a PeFile>, image: &PeImage) -> Result<Self> {
        let mut sections = Vec::new();
        if let Some(file) = file {
            for section in &file.sections {
                sections.push(detach(section, file.optional_header.file_alignment)?);
            }
        }

        Ok(ClonedSections {
            file,
            image_base: image.image_base,
            is_32bit: image.is_32bit(),
            patches: sections.iter().map(|_| Vec::new()).collect(),
            original: sections.iter().map(|s| (s.rva(), s.virtual_size())).collect(),
            sections,
        })
    }

    /// Places `segment` at `rva` in the copy of the section containing it, if it fits into
    /// `size` bytes there.
    fn try_patch(&mut self, segment: &SegmentRef, rva: u32, size: u32) -> bool {
        let Some(file) = self.file else {
            return false;
        };
        let Ok(offset) = file.rva_to_file_offset(rva) else {
            return false;
        };

        segment.update_offsets(&RelocationParameters::with_image(
            self.image_base,
            offset,
            rva,
            self.is_32bit,
        ));
        let length = segment.physical_size();
        if length > size {
            return false;
        }

        let Some(index) = self.sections.iter().position(|s| s.contains_rva(rva)) else {
            return false;
        };
        let section = &self.sections[index];
        let relative_offset = rva - section.rva();
        if section.contents().is_none() || relative_offset + length > section.physical_size() {
            return false;
        }

        self.patches[index].push(Patch::Segment {
            relative_offset,
            segment: Arc::clone(segment),
        });
        tracing::debug!(section = %section.name, rva, "patched in place");
        true
    }

    fn try_patch_directory(&mut self, segment: &SegmentRef, index: DataDirectoryIndex) -> bool {
        match self.file.map(|file| file.data_directory(index)) {
            Some(directory) if directory.is_present() => {
                self.try_patch(segment, directory.virtual_address, directory.size)
            }
            _ => false,
        }
    }

    fn into_sections(self) -> Vec<PeSection> {
        self.sections
            .into_iter()
            .zip(self.patches)
            .map(|(mut section, patches)| {
                if let (false, Some(contents)) = (patches.is_empty(), section.contents().cloned()) {
                    let mut patched = PatchedSegment::new(contents);
                    for patch in patches {
                        patched.add(patch);
                    }
                    section.set_contents(Some(Arc::new(patched)));
                }
                section
            })
            .collect()
    }
}

/// Copies a section without sharing its contents, so that laying out the copy leaves the
/// original file untouched.
fn detach(section: &PeSection, file_alignment: u32) -> Result<PeSection> {
    let physical_size = section.physical_size();
    let physical: Option<SegmentRef> = if physical_size == 0 {
        None
    } else {
        match section.create_reader() {
            Some(reader) => Some(Arc::new(ReaderSegment::new(
                reader.fork_relative_sized(0, physical_size)?,
            ))),
            None => Some(Arc::new(DataSegment::with_location(
                section.to_bytes()?,
                section.offset(),
                section.rva(),
            ))),
        }
    };

    let mut copy = PeSection::from_header(&section.create_header(file_alignment), None);
    let contents = VirtualSegment::new(physical, section.virtual_size());
    contents.update_offsets(&RelocationParameters::new(section.offset(), section.rva()));
    copy.set_contents(Some(Arc::new(contents)));
    Ok(copy)
}

/// Where [`create_sections`] put the rebuilt directories.
#[derive(Default)]
pub(super) struct PlacedDirectories {
    clr: Option<SegmentRef>,
    debug: Option<SegmentRef>,
    resources: Option<SegmentRef>,
    relocations: Option<SegmentRef>,
    original: Vec<(u32, u32)>,
}

/// Adds the copies of the original sections and the auxiliary sections to `file`.
///
/// The original data directories are copied too, before the first layout, so that they follow
/// the copies if the headers grow.
pub(super) fn create_sections(
    context: &BuilderContext,
    image: &PeImage,
    file: &mut PeFile,
) -> Result<PlacedDirectories> {
    let base = image.file().map(|file| &**file);
    let mut cloned = ClonedSections::new(base, image)?;
    let mut placed = PlacedDirectories::default();

    let mut auxtext = SegmentBuilder::new();
    if let Some(dotnet) = &context.dotnet {
        let header = dotnet.header();
        if !cloned.try_patch_directory(&header, DataDirectoryIndex::Clr) {
            auxtext.add(Arc::clone(&header), AUX_ALIGNMENT);
        }
        auxtext.add(dotnet.contents(), context.pointer_size());
        placed.clr = Some(header);
    }

    if let Some(debug) = &context.debug {
        let table: SegmentRef = debug.clone();
        if !cloned.try_patch_directory(&table, DataDirectoryIndex::Debug) {
            auxtext.add(Arc::clone(&table), AUX_ALIGNMENT);
        }
        auxtext.add(debug.contents(), AUX_ALIGNMENT);
        placed.debug = Some(table);
    }

    if let Some(stub) = &context.bootstrapper {
        auxtext.add(Arc::clone(&stub.segment), context.platform.thunk_stub_alignment());
    }

    for segment in &context.export_segments {
        auxtext.add(Arc::clone(segment), context.pointer_size());
    }

    let mut rsrc = None;
    if let Some(resources) = &context.resources {
        let segment: SegmentRef = resources.clone();
        if !cloned.try_patch_directory(&segment, DataDirectoryIndex::Resource) {
            rsrc = Some(Arc::clone(&segment));
        }
        placed.resources = Some(segment);
    }

    let mut reloc = None;
    if let Some(relocations) = &context.relocation_directory {
        let segment: SegmentRef = relocations.clone();
        if !cloned.try_patch_directory(&segment, DataDirectoryIndex::BaseRelocation) {
            reloc = Some(Arc::clone(&segment));
        }
        placed.relocations = Some(segment);
    }

    placed.original.clone_from(&cloned.original);
    for section in cloned.into_sections() {
        file.add_section(section);
    }

    if !auxtext.is_empty() {
        file.add_section(PeSection::new(
            ".auxtext",
            SectionFlags::CONTENT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            Some(Arc::new(auxtext)),
        ));
    }

    if let Some(exports) = &context.exports {
        let mut sdata = SegmentBuilder::new();
        sdata.add(exports.clone(), context.pointer_size());
        file.add_section(PeSection::new(
            ".sdata",
            SectionFlags::MEM_READ | SectionFlags::MEM_WRITE | SectionFlags::CONTENT_INITIALIZED_DATA,
            Some(Arc::new(sdata)),
        ));
    }

    if let Some(resources) = rsrc {
        file.add_section(PeSection::new(
            ".auxrsrc",
            SectionFlags::MEM_READ | SectionFlags::CONTENT_INITIALIZED_DATA,
            Some(resources),
        ));
    }

    if let Some(relocations) = reloc {
        file.add_section(PeSection::new(
            ".reloc",
            SectionFlags::MEM_READ
                | SectionFlags::CONTENT_INITIALIZED_DATA
                | SectionFlags::MEM_DISCARDABLE,
            Some(relocations),
        ));
    }

    let mut directories = base.map_or_else(Vec::new, |base| base.optional_header.data_directories.clone());
    directories.resize(DEFAULT_NUMBER_OF_RVA_AND_SIZES, DataDirectory::default());
    // The signature does not survive the rebuild, and the overlay holding it is not copied.
    directories[DataDirectoryIndex::Certificate as usize] = DataDirectory::default();
    file.optional_header.data_directories = directories;

    Ok(placed)
}

/// Overrides the copied data directories with the rebuilt ones.
pub(super) fn assign_data_directories(
    context: &BuilderContext,
    placed: &PlacedDirectories,
    file: &mut PeFile,
) {
    let exports = context.exports.clone().map(|s| s as SegmentRef);
    for (index, segment) in [
        (DataDirectoryIndex::Export, &exports),
        (DataDirectoryIndex::Debug, &placed.debug),
        (DataDirectoryIndex::Resource, &placed.resources),
        (DataDirectoryIndex::Clr, &placed.clr),
        (DataDirectoryIndex::BaseRelocation, &placed.relocations),
    ] {
        if segment.is_some() {
            file.set_data_directory(index, directory_of(segment.as_ref()));
        }
    }
}

/// The original entry point, moved along with its section; the bootstrapper if there was
/// none.
pub(super) fn entry_point(
    context: &BuilderContext,
    image: &PeImage,
    placed: &PlacedDirectories,
    file: &PeFile,
) -> u32 {
    let original = image
        .file()
        .map_or(0, |base| base.optional_header.address_of_entry_point);
    if original == 0 {
        return context.bootstrapper_rva().unwrap_or(0);
    }

    placed
        .original
        .iter()
        .zip(&file.sections)
        .find(|((rva, size), _)| original >= *rva && original - rva < *size)
        .map_or(original, |((rva, _), section)| section.rva() + (original - rva))
}
