//! Synthetic inputs shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use peweave::prelude::Segment;

use peweave::{
    io::MemoryStreamWriter,
    metadata::{
        heaps::BlobHeapBuilder, Cor20Header, DotNetDirectoryFlags, MetadataBuilder, TableIndex,
        TablesStreamBuilder, Token,
    },
    pe::{
        Characteristics, DataDirectory, DataDirectoryIndex, MachineType, PeFile, PeSection,
        SectionFlags,
    },
    segment::DataSegment,
};

/// RVA of the only section of the sample files.
pub const SECTION_RVA: u32 = 0x2000;

/// `ldarg.0; ret`
pub const TINY_BODY: [u8; 3] = [0x0A, 0x02, 0x2A];

/// `ldc.i4.0; pop; ret` with a fat header.
pub const FAT_BODY: [u8; 15] = [
    0x03, 0x30, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x16, 0x26, 0x2A,
];

/// Initial value of the only field with an RVA.
pub const FIELD_DATA: [u8; 4] = [0x78, 0x56, 0x34, 0x12];

const TINY_OFFSET: usize = 0x50;
const FAT_OFFSET: usize = 0x60;
const FIELD_OFFSET: usize = 0x80;
const METADATA_OFFSET: usize = 0x100;

fn sample_metadata() -> Vec<u8> {
    let mut blobs = BlobHeapBuilder::new();
    let method_signature = blobs.add(&[0x20, 0x00, 0x01]).unwrap();
    let field_signature = blobs.add(&[0x06, 0x08]).unwrap();

    let rva = |offset: usize| SECTION_RVA + offset as u32;
    let mut tables = TablesStreamBuilder::new();
    tables.add_row(TableIndex::TypeDef, vec![0, 0, 0, 0, 1, 1]).unwrap();
    tables
        .add_row(TableIndex::Field, vec![0x0113, 0, field_signature])
        .unwrap();
    for offset in [TINY_OFFSET, FAT_OFFSET] {
        tables
            .add_row(
                TableIndex::MethodDef,
                vec![rva(offset), 0, 0x0086, 0, method_signature, 1],
            )
            .unwrap();
    }
    tables
        .add_row(TableIndex::FieldRva, vec![rva(FIELD_OFFSET), 1])
        .unwrap();

    MetadataBuilder::new()
        .with_stream("#~", tables.build().unwrap())
        .with_stream("#Blob", blobs.build().unwrap())
        .build()
        .unwrap()
}

/// An IL-only executable with two methods and one field with an RVA, all in `.text`.
pub fn dotnet_file(machine: MachineType) -> PeFile {
    let metadata = sample_metadata();

    let header = Cor20Header {
        cb: Cor20Header::SIZE,
        major_runtime_version: 2,
        minor_runtime_version: 5,
        metadata: DataDirectory::new(
            SECTION_RVA + METADATA_OFFSET as u32,
            metadata.len() as u32,
        ),
        flags: DotNetDirectoryFlags::IL_ONLY,
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

    let mut text = vec![0u8; METADATA_OFFSET + metadata.len()];
    text[..writer.as_slice().len()].copy_from_slice(writer.as_slice());
    text[TINY_OFFSET..TINY_OFFSET + TINY_BODY.len()].copy_from_slice(&TINY_BODY);
    text[FAT_OFFSET..FAT_OFFSET + FAT_BODY.len()].copy_from_slice(&FAT_BODY);
    text[FIELD_OFFSET..FIELD_OFFSET + FIELD_DATA.len()].copy_from_slice(&FIELD_DATA);
    text[METADATA_OFFSET..].copy_from_slice(&metadata);

    let mut file = PeFile::with_machine(machine);
    file.file_header.characteristics |= Characteristics::EXECUTABLE_IMAGE;
    file.add_section(PeSection::new(
        ".text",
        SectionFlags::CONTENT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
        Some(Arc::new(DataSegment::new(text))),
    ));
    file.update_headers().unwrap();
    assert_eq!(file.sections[0].rva(), SECTION_RVA);

    file.set_data_directory(
        DataDirectoryIndex::Clr,
        DataDirectory::new(SECTION_RVA, Cor20Header::SIZE),
    );
    file
}

/// Reads `count` bytes at `rva` of `file`.
pub fn read_at(file: &PeFile, rva: u32, count: usize) -> Vec<u8> {
    let mut reader = file.create_reader_at_rva(rva).unwrap();
    (0..count).map(|_| reader.read_u8().unwrap()).collect()
}
