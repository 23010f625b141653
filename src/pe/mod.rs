//! The PE/COFF file model.
//!
//! A [`PeFile`] is the raw view of an image: the DOS stub, the COFF and optional headers, the
//! section table and the contents of each section. It knows nothing about imports, metadata or
//! method bodies; those are interpreted on top of it by [`crate::image`].
//!
//! # Layout
//!
//! ```text
//! 0x0000  DOS header + stub          (DosHeader, e_lfanew at 0x3C)
//! e_lfanew "PE\0\0"
//!         COFF file header           (20 bytes)
//!         optional header            (0xE0 PE32 / 0xF0 PE32+, incl. 16 data directories)
//!         section table              (40 bytes per section)
//!         extra section data         (optional, up to SizeOfHeaders)
//! SizeOfHeaders
//!         section raw data           (each padded to FileAlignment)
//!         EOF data                   (overlay)
//! ```
//!
//! # Address translation
//!
//! Each section maps `[VirtualAddress, VirtualAddress + VirtualSize)` onto
//! `[PointerToRawData, PointerToRawData + SizeOfRawData)`. Translating between RVAs and file
//! offsets therefore requires finding the containing section; addresses inside the headers
//! belong to no section and fail with [`crate::Error::AddressOutOfRange`].
//!
//! # Layout recomputation
//!
//! After sections are added, removed or resized, [`PeFile::update_headers`] re-derives every
//! layout-dependent header field in one pass. [`PeFile::write`] calls it implicitly.

mod checksum;
mod file;
mod headers;
mod parameters;
mod section;

pub use checksum::compute_checksum;
pub use file::PeFile;
pub use headers::{
    Characteristics, DataDirectory, DataDirectoryIndex, DllCharacteristics, DosHeader,
    FileHeader, MachineType, OptionalHeader, OptionalHeaderMagic, SubSystem,
    CHECKSUM_FIELD_OFFSET, DEFAULT_NUMBER_OF_RVA_AND_SIZES, DOS_SIGNATURE, FILE_HEADER_SIZE,
    NEXT_HEADER_FIELD_OFFSET, PE_SIGNATURE,
};
pub use parameters::{MappingMode, ReaderParameters};
pub use section::{PeSection, SectionFlags, SectionHeader, MAX_SECTION_NAME_LENGTH, SECTION_HEADER_SIZE};
