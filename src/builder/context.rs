//! State shared by the stages of a build.

use std::sync::Arc;

use crate::{
    image::{BaseRelocation, ExportAddress, PeImage},
    segment::{Segment, SegmentRef},
    Result,
};

use super::{
    config::BuilderConfig,
    debug::DebugDirectoryBuffer,
    dotnet::{collect_field_data, collect_method_bodies, DotNetSegmentBuffer},
    exports::ExportDirectoryBuffer,
    imports::ImportDirectoryBuffer,
    platform::{Platform, ThunkStub},
    relocations::RelocationDirectoryBuffer,
    resources::ResourceDirectoryBuffer,
};

/// The directory buffers of one image, filled before any section exists.
pub(super) struct BuilderContext {
    pub(super) platform: Platform,
    pub(super) is_32bit: bool,
    pub(super) imports: Option<ImportDirectoryBuffer>,
    pub(super) exports: Option<Arc<ExportDirectoryBuffer>>,
    /// Segments that exported symbols point into and that nothing else places.
    pub(super) export_segments: Vec<SegmentRef>,
    pub(super) debug: Option<Arc<DebugDirectoryBuffer>>,
    pub(super) resources: Option<Arc<ResourceDirectoryBuffer>>,
    pub(super) relocations: Vec<BaseRelocation>,
    pub(super) relocation_directory: Option<Arc<RelocationDirectoryBuffer>>,
    pub(super) bootstrapper: Option<ThunkStub>,
    pub(super) dotnet: Option<DotNetSegmentBuffer>,
    pub(super) vtable_fixups: Option<SegmentRef>,
}

impl BuilderContext {
    /// An empty context for the platform of `image`.
    pub(super) fn new(image: &PeImage) -> Result<Self> {
        Ok(BuilderContext {
            platform: Platform::get(image.machine_type)?,
            is_32bit: image.is_32bit(),
            imports: None,
            exports: None,
            export_segments: Vec::new(),
            debug: None,
            resources: None,
            relocations: Vec::new(),
            relocation_directory: None,
            bootstrapper: None,
            dotnet: None,
            vtable_fixups: None,
        })
    }

    pub(super) fn pointer_size(&self) -> u32 {
        if self.is_32bit {
            4
        } else {
            8
        }
    }

    pub(super) fn add_exports(&mut self, image: &PeImage) -> Result<()> {
        let Some(exports) = image.exports()? else {
            return Ok(());
        };
        if exports.entries.is_empty() {
            return Ok(());
        }

        for entry in &exports.entries {
            if let ExportAddress::Segment(reference) = &entry.address {
                let segment = reference.segment();
                if !self.export_segments.iter().any(|s| Arc::ptr_eq(s, segment)) {
                    self.export_segments.push(Arc::clone(segment));
                }
            }
        }
        self.exports = Some(Arc::new(ExportDirectoryBuffer::new(exports)?));
        Ok(())
    }

    pub(super) fn add_debug_data(&mut self, image: &PeImage) -> Result<()> {
        let entries = image.debug_data()?;
        if !entries.is_empty() {
            self.debug = Some(Arc::new(DebugDirectoryBuffer::new(entries.to_vec())));
        }
        Ok(())
    }

    pub(super) fn add_resources(&mut self, image: &PeImage) -> Result<()> {
        if let Some(root) = image.resources()? {
            self.resources = Some(Arc::new(ResourceDirectoryBuffer::new(root)?));
        }
        Ok(())
    }

    /// Lays out the CLR data. With `replacements_only`, bodies and field data that were not
    /// replaced keep their original RVAs.
    pub(super) fn add_dotnet(
        &mut self,
        image: &PeImage,
        config: &BuilderConfig,
        replacements_only: bool,
    ) -> Result<()> {
        let Some(directory) = image.dotnet()? else {
            return Ok(());
        };

        let file = image.file().map(|file| &**file);
        let listener = config.error_listener.as_ref();
        let bodies = collect_method_bodies(
            file,
            directory,
            self.pointer_size(),
            replacements_only,
            listener,
        )?;
        let fields = collect_field_data(
            file,
            directory,
            config.field_rva_reader.as_ref(),
            replacements_only,
            listener,
        )?;

        self.dotnet = Some(DotNetSegmentBuffer::new(directory, &bodies, &fields)?);
        self.vtable_fixups.clone_from(&directory.vtable_fixups);
        Ok(())
    }

    /// Builds the `.reloc` contents from the collected relocations and those of the
    /// bootstrapper. Must run after the bootstrapper is created.
    pub(super) fn seal_relocations(&mut self) {
        let mut relocations = std::mem::take(&mut self.relocations);
        if let Some(stub) = &self.bootstrapper {
            relocations.extend(stub.relocations.iter().cloned());
        }

        let buffer = RelocationDirectoryBuffer::new(relocations);
        self.relocation_directory = (!buffer.is_empty()).then(|| Arc::new(buffer));
    }

    /// RVA of the bootstrapper stub, if one was created.
    pub(super) fn bootstrapper_rva(&self) -> Option<u32> {
        self.bootstrapper.as_ref().map(|stub| stub.segment.rva())
    }
}
