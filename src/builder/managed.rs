//! Rebuilds a .NET image from scratch.
//!
//! Every directory is serialized again and nothing of the original section layout survives:
//!
//! ```text
//! .text   IAT, COR20 header, field data, method bodies, metadata, CLR blobs,
//!         import directory, debug directory, bootstrapper, exported segments
//! .sdata  VTable fixups, export directory                   (when present)
//! .rsrc   Win32 resources                                   (when present)
//! .reloc  base relocations                                  (when present)
//! ```

use std::sync::Arc;

use crate::{
    image::{directory_of, ImportedModule, ImportedSymbol, PeImage},
    pe::{DataDirectory, DataDirectoryIndex, PeFile, PeSection, SectionFlags, DEFAULT_NUMBER_OF_RVA_AND_SIZES},
    segment::{SegmentBuilder, SegmentRef},
    Error, Result,
};

use super::{
    clr_entry_point_name, config::BuilderConfig, context::BuilderContext,
    imports::ImportDirectoryBuffer, MSCOREE,
};

/// Alignment of the directories inside `.text`.
const TEXT_ALIGNMENT: u32 = 4;

/// Fills the directory buffers of `context`.
pub(super) fn populate(context: &mut BuilderContext, image: &PeImage, config: &BuilderConfig) -> Result<()> {
    match image.dotnet()? {
        None => config
            .error_listener
            .bad_image("Image does not contain a .NET directory")?,
        Some(directory) => {
            let has_tables = match directory.metadata.as_deref() {
                Some(metadata) => metadata.tables()?.is_some(),
                None => false,
            };
            if !has_tables {
                config
                    .error_listener
                    .bad_image("Image does not have a .NET metadata tables stream")?;
            }
        }
    }

    context.add_dotnet(image, config, false)?;
    context.add_exports(image)?;
    add_imports(context, image)?;
    context.add_debug_data(image)?;
    context.add_resources(image)?;

    // Relocations read from the original file point at locations that no longer exist.
    context.relocations = image
        .relocations()?
        .iter()
        .filter(|relocation| relocation.location.is_bounded())
        .cloned()
        .collect();
    context.seal_relocations();
    Ok(())
}

/// Imports the CLR entry point when the image needs a native bootstrapper, and drops it
/// otherwise.
fn add_imports(context: &mut BuilderContext, image: &PeImage) -> Result<()> {
    let required = image.dotnet()?.is_some_and(|directory| {
        context.platform.is_clr_bootstrapper_required() || !directory.is_il_only()
    });
    let entry_point = clr_entry_point_name(image);

    let mut modules = image.imports()?.to_vec();
    let mscoree = modules
        .iter()
        .position(|module| module.name.eq_ignore_ascii_case(MSCOREE));

    if required {
        let index = mscoree.unwrap_or_else(|| {
            modules.push(ImportedModule::new(MSCOREE));
            modules.len() - 1
        });
        let module = &mut modules[index];
        if module.symbol(entry_point).is_none() {
            module.symbols.push(ImportedSymbol::by_name(0, entry_point));
        }
    } else if let Some(index) = mscoree {
        let module = &mut modules[index];
        if let Some(symbol) = module.symbol_index(entry_point) {
            module.symbols.remove(symbol);
        }
        if module.symbols.is_empty() {
            modules.remove(index);
        }
    }

    let buffer = ImportDirectoryBuffer::new(&modules, context.is_32bit);
    if required {
        let slot = buffer.symbol_reference(MSCOREE, entry_point).ok_or_else(|| {
            Error::Error(format!("{MSCOREE}!{entry_point} was required but not imported"))
        })?;
        context.bootstrapper = Some(context.platform.create_thunk_stub(Arc::new(slot)));
        tracing::debug!(platform = %context.platform, entry_point, "added CLR bootstrapper");
    }

    if !buffer.is_empty() {
        context.imports = Some(buffer);
    }
    Ok(())
}

/// Adds the sections to `file`.
pub(super) fn create_sections(context: &BuilderContext, file: &mut PeFile) {
    file.add_section(create_text_section(context));

    if context.exports.is_some() || context.vtable_fixups.is_some() {
        let mut contents = SegmentBuilder::new();
        if let Some(fixups) = &context.vtable_fixups {
            contents.add(Arc::clone(fixups), context.pointer_size());
        }
        if let Some(exports) = &context.exports {
            contents.add(exports.clone(), context.pointer_size());
        }
        file.add_section(PeSection::new(
            ".sdata",
            SectionFlags::MEM_READ | SectionFlags::MEM_WRITE | SectionFlags::CONTENT_INITIALIZED_DATA,
            Some(Arc::new(contents)),
        ));
    }

    if let Some(resources) = &context.resources {
        file.add_section(PeSection::new(
            ".rsrc",
            SectionFlags::MEM_READ | SectionFlags::CONTENT_INITIALIZED_DATA,
            Some(resources.clone()),
        ));
    }

    if let Some(relocations) = &context.relocation_directory {
        file.add_section(PeSection::new(
            ".reloc",
            SectionFlags::MEM_READ
                | SectionFlags::CONTENT_INITIALIZED_DATA
                | SectionFlags::MEM_DISCARDABLE,
            Some(relocations.clone()),
        ));
    }
}

fn create_text_section(context: &BuilderContext) -> PeSection {
    let mut contents = SegmentBuilder::new();

    if let Some(imports) = &context.imports {
        contents.add(imports.address_table(), context.pointer_size());
    }

    if let Some(dotnet) = &context.dotnet {
        contents.add(dotnet.header(), TEXT_ALIGNMENT);
        contents.add(dotnet.contents(), TEXT_ALIGNMENT);
    }

    if let Some(imports) = &context.imports {
        contents.add(imports.directory(), TEXT_ALIGNMENT);
    }

    if let Some(debug) = &context.debug {
        contents.add(debug.clone(), TEXT_ALIGNMENT);
        contents.add(debug.contents(), TEXT_ALIGNMENT);
    }

    if let Some(stub) = &context.bootstrapper {
        contents.add(Arc::clone(&stub.segment), context.platform.thunk_stub_alignment());
    }

    for segment in &context.export_segments {
        contents.add(Arc::clone(segment), context.pointer_size());
    }

    PeSection::new(
        ".text",
        SectionFlags::CONTENT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
        Some(Arc::new(contents)),
    )
}

/// Points the data directories at the placed buffers. Everything else is cleared.
pub(super) fn assign_data_directories(context: &BuilderContext, file: &mut PeFile) {
    file.optional_header.data_directories =
        vec![DataDirectory::default(); DEFAULT_NUMBER_OF_RVA_AND_SIZES];

    if let Some(imports) = &context.imports {
        file.set_data_directory(DataDirectoryIndex::Import, directory_of(Some(&imports.directory())));
        file.set_data_directory(DataDirectoryIndex::Iat, directory_of(Some(&imports.address_table())));
    }

    let placed: [(DataDirectoryIndex, Option<SegmentRef>); 5] = [
        (DataDirectoryIndex::Export, context.exports.clone().map(|s| s as SegmentRef)),
        (DataDirectoryIndex::Debug, context.debug.clone().map(|s| s as SegmentRef)),
        (DataDirectoryIndex::Resource, context.resources.clone().map(|s| s as SegmentRef)),
        (DataDirectoryIndex::Clr, context.dotnet.as_ref().map(|dotnet| dotnet.header())),
        (
            DataDirectoryIndex::BaseRelocation,
            context.relocation_directory.clone().map(|s| s as SegmentRef),
        ),
    ];
    for (index, segment) in placed {
        if segment.is_some() {
            file.set_data_directory(index, directory_of(segment.as_ref()));
        }
    }
}

/// The bootstrapper, or no entry point at all for images the runtime starts directly.
pub(super) fn entry_point(context: &BuilderContext) -> u32 {
    context.bootstrapper_rva().unwrap_or(0)
}
