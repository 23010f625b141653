//! Factory methods for synthetic PE files.

use std::sync::Arc;

use crate::{
    pe::{PeFile, PeSection, SectionFlags},
    segment::{DataSegment, VirtualSegment},
};

/// A laid-out 32-bit file with two sections:
///
/// - `.text` at RVA 0x2000 / offset 0x200, 0x200 bytes counting up from 0
/// - `.data` at RVA 0x4000 / offset 0x400, 0x200 bytes of 0xDA mapped as 0x300 bytes
pub fn build_sample_file() -> PeFile {
    let mut file = PeFile::new();

    let text: Vec<u8> = (0..0x200u32).map(|i| (i & 0xFF) as u8).collect();
    file.add_section(PeSection::new(
        ".text",
        SectionFlags::CONTENT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
        Some(Arc::new(DataSegment::new(text))),
    ));

    let data = DataSegment::new(vec![0xDA; 0x200]);
    file.add_section(PeSection::new(
        ".data",
        SectionFlags::CONTENT_INITIALIZED_DATA | SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
        Some(Arc::new(VirtualSegment::new(Some(Arc::new(data)), 0x300))),
    ));

    file.update_headers().expect("sample layout");
    file
}

/// The bytes of [`build_sample_file`].
pub fn sample_file_bytes() -> Vec<u8> {
    build_sample_file().to_bytes().expect("sample bytes")
}
