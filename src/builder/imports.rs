//! Import directory and import address table.
//!
//! The two are emitted as separate segments because the IAT usually lives at the start of
//! `.text` while the descriptors follow the CLR data. They still describe one layout: the
//! descriptors point into the IAT and every IAT slot initially holds the same value as its
//! lookup table entry, a hint/name RVA inside the directory segment. Both segments therefore
//! share an [`ImportLayout`] that stores their locations.
//!
//! Directory segment layout:
//!
//! ```text
//! descriptors (20 bytes each) + null descriptor
//! lookup table per module (native ints, null terminated)
//! module names (ASCII, NUL terminated)
//! hint/name entries (u16 hint + ASCII name, 2-byte aligned)
//! ```

use std::{fmt, sync::Arc};

use crate::{
    image::{ImportedModule, IMPORT_DESCRIPTOR_SIZE},
    io::BinaryStreamWriter,
    segment::{RelocationParameters, Segment, SegmentOffsets, SegmentRef, SegmentReference},
    utils::align_up_u32,
    Result,
};

struct ModuleLayout {
    module: ImportedModule,
    lookup_table: u32,
    name: u32,
    hint_names: Vec<Option<u32>>,
    address_table: u32,
}

/// Relative positions of every import structure, shared by both segments.
struct ImportLayout {
    is_32bit: bool,
    modules: Vec<ModuleLayout>,
    directory_size: u32,
    address_table_size: u32,
    directory: SegmentOffsets,
    address_table: SegmentOffsets,
}

impl ImportLayout {
    fn new(modules: &[ImportedModule], is_32bit: bool) -> Self {
        let pointer_size: u32 = if is_32bit { 4 } else { 8 };
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);

        let mut cursor = (count(modules.len()) + 1) * IMPORT_DESCRIPTOR_SIZE;
        cursor = align_up_u32(cursor, pointer_size);

        let mut layouts: Vec<ModuleLayout> = modules
            .iter()
            .map(|module| {
                let lookup_table = cursor;
                cursor += (count(module.symbols.len()) + 1) * pointer_size;
                ModuleLayout {
                    module: module.clone(),
                    lookup_table,
                    name: 0,
                    hint_names: Vec::with_capacity(module.symbols.len()),
                    address_table: 0,
                }
            })
            .collect();

        for layout in &mut layouts {
            layout.name = cursor;
            cursor += count(layout.module.name.len()) + 1;
        }

        for layout in &mut layouts {
            for symbol in &layout.module.symbols {
                match &symbol.name {
                    Some(name) => {
                        cursor = align_up_u32(cursor, 2);
                        layout.hint_names.push(Some(cursor));
                        cursor += 2 + count(name.len()) + 1;
                    }
                    None => layout.hint_names.push(None),
                }
            }
        }

        let mut address_table = 0;
        for layout in &mut layouts {
            layout.address_table = address_table;
            address_table += (count(layout.module.symbols.len()) + 1) * pointer_size;
        }

        ImportLayout {
            is_32bit,
            modules: layouts,
            directory_size: align_up_u32(cursor, 4),
            address_table_size: address_table,
            directory: SegmentOffsets::default(),
            address_table: SegmentOffsets::default(),
        }
    }

    fn thunk_value(&self, layout: &ModuleLayout, index: usize) -> u64 {
        match layout.hint_names[index] {
            Some(hint_name) => u64::from(self.directory.rva() + hint_name),
            None => {
                let flag = if self.is_32bit { 0x8000_0000 } else { 0x8000_0000_0000_0000 };
                flag | u64::from(layout.module.symbols[index].ordinal)
            }
        }
    }

    fn write_thunks(&self, layout: &ModuleLayout, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        for index in 0..layout.module.symbols.len() {
            writer.write_native_int(self.thunk_value(layout, index), self.is_32bit)?;
        }
        writer.write_native_int(0, self.is_32bit)
    }
}

#[derive(Clone, Copy)]
enum Role {
    Directory,
    AddressTable,
}

struct ImportSegment {
    layout: Arc<ImportLayout>,
    role: Role,
}

impl ImportSegment {
    fn offsets(&self) -> &SegmentOffsets {
        match self.role {
            Role::Directory => &self.layout.directory,
            Role::AddressTable => &self.layout.address_table,
        }
    }

    fn write_directory(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let layout = &self.layout;
        let start = writer.offset();
        let base = layout.directory.rva();

        for module in &layout.modules {
            writer.write_u32(base + module.lookup_table)?;
            writer.write_u32(module.module.time_date_stamp)?;
            writer.write_u32(module.module.forwarder_chain)?;
            writer.write_u32(base + module.name)?;
            writer.write_u32(layout.address_table.rva() + module.address_table)?;
        }
        writer.write_zeroes(u64::from(IMPORT_DESCRIPTOR_SIZE))?;

        let pad_to = |writer: &mut dyn BinaryStreamWriter, relative: u32| -> Result<()> {
            let target = start + u64::from(relative);
            let current = writer.offset();
            if target > current {
                writer.write_zeroes(target - current)?;
            }
            Ok(())
        };

        for module in &layout.modules {
            pad_to(writer, module.lookup_table)?;
            layout.write_thunks(module, writer)?;
        }

        for module in &layout.modules {
            writer.write_ascii_string(&module.module.name)?;
        }

        for module in &layout.modules {
            for (symbol, hint_name) in module.module.symbols.iter().zip(&module.hint_names) {
                let (Some(name), Some(hint_name)) = (&symbol.name, hint_name) else {
                    continue;
                };
                pad_to(writer, *hint_name)?;
                writer.write_u16(symbol.hint)?;
                writer.write_ascii_string(name)?;
            }
        }

        pad_to(writer, layout.directory_size)
    }
}

impl Segment for ImportSegment {
    fn offset(&self) -> u64 {
        self.offsets().offset()
    }

    fn rva(&self) -> u32 {
        self.offsets().rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets().update(parameters);
    }

    fn physical_size(&self) -> u32 {
        match self.role {
            Role::Directory => self.layout.directory_size,
            Role::AddressTable => self.layout.address_table_size,
        }
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        match self.role {
            Role::Directory => self.write_directory(writer),
            Role::AddressTable => {
                for module in &self.layout.modules {
                    self.layout.write_thunks(module, writer)?;
                }
                Ok(())
            }
        }
    }
}

/// The import directory of an image under construction.
#[derive(Clone)]
pub struct ImportDirectoryBuffer {
    layout: Arc<ImportLayout>,
    directory: SegmentRef,
    address_table: SegmentRef,
}

impl ImportDirectoryBuffer {
    /// Lays out `modules` for an image with the given pointer width. Module order is kept.
    #[must_use]
    pub fn new(modules: &[ImportedModule], is_32bit: bool) -> Self {
        let layout = Arc::new(ImportLayout::new(modules, is_32bit));
        let directory: SegmentRef = Arc::new(ImportSegment {
            layout: Arc::clone(&layout),
            role: Role::Directory,
        });
        let address_table: SegmentRef = Arc::new(ImportSegment {
            layout: Arc::clone(&layout),
            role: Role::AddressTable,
        });
        ImportDirectoryBuffer {
            layout,
            directory,
            address_table,
        }
    }

    /// Whether there is nothing to import.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.modules.is_empty()
    }

    /// The descriptors, lookup tables and names.
    #[must_use]
    pub fn directory(&self) -> SegmentRef {
        Arc::clone(&self.directory)
    }

    /// The import address table.
    #[must_use]
    pub fn address_table(&self) -> SegmentRef {
        Arc::clone(&self.address_table)
    }

    /// The IAT slot of `module!symbol`. Module names compare case-insensitively.
    #[must_use]
    pub fn symbol_reference(&self, module: &str, symbol: &str) -> Option<SegmentReference> {
        let pointer_size = if self.layout.is_32bit { 4 } else { 8 };
        self.layout
            .modules
            .iter()
            .filter(|layout| layout.module.name.eq_ignore_ascii_case(module))
            .find_map(|layout| {
                let index = u32::try_from(layout.module.symbol_index(symbol)?).ok()?;
                Some(SegmentReference::with_offset(
                    Arc::clone(&self.address_table),
                    layout.address_table + index * pointer_size,
                ))
            })
    }
}

impl fmt::Debug for ImportDirectoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportDirectoryBuffer")
            .field("modules", &self.layout.modules.len())
            .field("directory_size", &self.layout.directory_size)
            .field("address_table_size", &self.layout.address_table_size)
            .finish()
    }
}
