//! Factory methods for synthetic images with data directories.
//!
//! Every file built here has a single section at RVA 0x2000 / offset 0x200, so directory
//! contents can be written with absolute RVAs.

use std::sync::Arc;

use crate::{
    io::MemoryStreamWriter,
    metadata::{
        heaps::BlobHeapBuilder, tablestream::TablesStreamBuilder, Cor20Header,
        DotNetDirectoryFlags, MetadataBuilder, TableIndex, Token,
    },
    pe::{Characteristics, DataDirectory, DataDirectoryIndex, MachineType, PeFile, PeSection, SectionFlags},
    segment::{DataSegment, Segment},
};

/// RVA of the only section of the factory files.
pub const SECTION_RVA: u32 = 0x2000;

/// Little-endian byte buffer with a movable cursor, addressed relative to a base RVA.
pub struct ImageBytes {
    base_rva: u32,
    data: Vec<u8>,
    position: usize,
}

impl ImageBytes {
    pub fn new(base_rva: u32) -> Self {
        ImageBytes {
            base_rva,
            data: Vec::new(),
            position: 0,
        }
    }

    /// RVA of the cursor.
    pub fn rva(&self) -> u32 {
        self.base_rva + self.position as u32
    }

    pub fn seek(&mut self, relative: usize) -> &mut Self {
        self.position = relative;
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let end = self.position + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
        self
    }

    pub fn zeroes(&mut self, count: usize) -> &mut Self {
        self.bytes(&vec![0; count])
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Zero-terminated ASCII.
    pub fn ascii(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes()).u8(0)
    }

    /// UTF-16 code units without terminator.
    pub fn utf16(&mut self, value: &str) -> &mut Self {
        for unit in value.encode_utf16() {
            self.u16(unit);
        }
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

fn single_section_file(contents: Vec<u8>, is_32bit: bool, flags: SectionFlags) -> PeFile {
    let mut file = PeFile::with_machine(if is_32bit {
        MachineType::I386
    } else {
        MachineType::Amd64
    });
    file.file_header.characteristics |= Characteristics::EXECUTABLE_IMAGE;

    let mut contents = contents;
    if contents.len() < 0x400 {
        contents.resize(0x400, 0);
    }
    file.add_section(PeSection::new(".text", flags, Some(Arc::new(DataSegment::new(contents)))));
    file.update_headers().expect("factory layout");
    assert_eq!(file.sections[0].rva(), SECTION_RVA);
    file
}

/// A file whose only section holds `contents`, with directory `index` pointing at its start.
pub fn file_with_directory(
    contents: Vec<u8>,
    index: DataDirectoryIndex,
    size: u32,
    is_32bit: bool,
) -> PeFile {
    let mut file = single_section_file(
        contents,
        is_32bit,
        SectionFlags::CONTENT_INITIALIZED_DATA | SectionFlags::MEM_READ,
    );
    file.set_data_directory(index, DataDirectory::new(SECTION_RVA, size));
    file
}

/// Knobs of [`build_dotnet_file`].
#[derive(Debug, Clone)]
pub struct DotNetFileOptions {
    pub is_32bit: bool,
    pub il_only: bool,
    /// Marks the second method as native code.
    pub native_method: bool,
    /// Gives the second field the type `string`, whose data size cannot be derived.
    pub string_field: bool,
}

impl Default for DotNetFileOptions {
    fn default() -> Self {
        DotNetFileOptions {
            is_32bit: true,
            il_only: true,
            native_method: false,
            string_field: false,
        }
    }
}

/// Relative offsets of the pieces of [`build_dotnet_file`] inside its section.
pub mod layout {
    pub const TINY_BODY: u32 = 0x50;
    pub const FAT_BODY: u32 = 0x60;
    pub const FIELD_DATA: u32 = 0x80;
    pub const STRUCT_DATA: u32 = 0x90;
    pub const METADATA: u32 = 0x100;
}

/// The tiny body of method 1: `ldarg.0; ret`.
pub const TINY_BODY: [u8; 3] = [0x0A, 0x02, 0x2A];

/// The fat body of method 2: `ldc.i4.0; pop; ret`, max stack 2.
pub const FAT_BODY: [u8; 15] = [
    0x03, 0x30, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x16, 0x26, 0x2A,
];

/// Metadata with two methods, three fields with RVAs and one class layout.
///
/// - Field 1: `int32`, data `78 56 34 12`
/// - Field 2: `modopt(...) native int` (or `string`), 8 bytes of `0xAA`
/// - Field 3: value type `TypeDef` 2 with `ClassSize` 12, data `01..0C`
pub fn build_sample_metadata(options: &DotNetFileOptions) -> Vec<u8> {
    let mut blobs = BlobHeapBuilder::new();
    let method_signature = blobs.add(&[0x20, 0x00, 0x01]).unwrap();
    let int_field = blobs.add(&[0x06, 0x08]).unwrap();
    let second_field = if options.string_field {
        blobs.add(&[0x06, 0x0E]).unwrap()
    } else {
        blobs.add(&[0x06, 0x20, 0x05, 0x18]).unwrap()
    };
    let struct_field = blobs.add(&[0x06, 0x11, 0x08]).unwrap();

    let section = |relative: u32| SECTION_RVA + relative;

    let mut tables = TablesStreamBuilder::new();
    tables.add_row(TableIndex::TypeDef, vec![0, 0, 0, 0, 1, 1]).unwrap();
    tables.add_row(TableIndex::TypeDef, vec![0x0108, 0, 0, 0, 4, 3]).unwrap();
    tables.add_row(TableIndex::TypeRef, vec![0, 0, 0]).unwrap();
    for signature in [int_field, second_field, struct_field] {
        tables.add_row(TableIndex::Field, vec![0x0113, 0, signature]).unwrap();
    }
    tables
        .add_row(
            TableIndex::MethodDef,
            vec![section(layout::TINY_BODY), 0, 0x0086, 0, method_signature, 1],
        )
        .unwrap();
    tables
        .add_row(
            TableIndex::MethodDef,
            vec![
                section(layout::FAT_BODY),
                u32::from(options.native_method),
                0x0086,
                0,
                method_signature,
                1,
            ],
        )
        .unwrap();
    tables.add_row(TableIndex::ClassLayout, vec![4, 12, 2]).unwrap();
    tables.add_row(TableIndex::FieldRva, vec![section(layout::FIELD_DATA), 1]).unwrap();
    tables.add_row(TableIndex::FieldRva, vec![section(layout::FIELD_DATA + 4), 2]).unwrap();
    tables.add_row(TableIndex::FieldRva, vec![section(layout::STRUCT_DATA), 3]).unwrap();

    MetadataBuilder::new()
        .with_stream("#~", tables.build().unwrap())
        .with_stream("#Blob", blobs.build().unwrap())
        .build()
        .unwrap()
}

/// A laid-out .NET file: COR20 header, method bodies, field data and metadata in `.text`.
pub fn build_dotnet_file(options: &DotNetFileOptions) -> PeFile {
    let metadata = build_sample_metadata(options);

    let header = Cor20Header {
        cb: Cor20Header::SIZE,
        major_runtime_version: 2,
        minor_runtime_version: 5,
        metadata: DataDirectory::new(SECTION_RVA + layout::METADATA, metadata.len() as u32),
        flags: if options.il_only {
            DotNetDirectoryFlags::IL_ONLY
        } else {
            DotNetDirectoryFlags::empty()
        },
        entry_point: Token::from_parts(TableIndex::MethodDef, 1).value(),
        resources: DataDirectory::default(),
        strong_name_signature: DataDirectory::default(),
        code_manager_table: DataDirectory::default(),
        vtable_fixups: DataDirectory::default(),
        export_address_table_jumps: DataDirectory::default(),
        managed_native_header: DataDirectory::default(),
    };
    let mut writer = MemoryStreamWriter::new();
    header.write(&mut writer).unwrap();

    let mut bytes = ImageBytes::new(SECTION_RVA);
    bytes.bytes(writer.as_slice());
    bytes.seek(layout::TINY_BODY as usize).bytes(&TINY_BODY);
    bytes.seek(layout::FAT_BODY as usize).bytes(&FAT_BODY);
    bytes.seek(layout::FIELD_DATA as usize).u32(0x1234_5678).bytes(&[0xAA; 8]);
    bytes
        .seek(layout::STRUCT_DATA as usize)
        .bytes(&(1..=12).collect::<Vec<u8>>());
    bytes.seek(layout::METADATA as usize).bytes(&metadata);

    let mut file = single_section_file(
        bytes.into_inner(),
        options.is_32bit,
        SectionFlags::CONTENT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
    );
    file.set_data_directory(DataDirectoryIndex::Clr, DataDirectory::new(SECTION_RVA, Cor20Header::SIZE));
    file
}

/// The bytes of [`build_dotnet_file`].
pub fn dotnet_file_bytes(options: &DotNetFileOptions) -> Vec<u8> {
    build_dotnet_file(options).to_bytes().expect("dotnet bytes")
}
