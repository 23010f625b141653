//! Base relocations.
//!
//! The relocation directory is a sequence of blocks, one per 4 KiB page:
//!
//! ```text
//! +0  PageRVA    u32
//! +4  BlockSize  u32  (header included)
//! +8  entries    u16 each: type in the high 4 bits, page offset in the low 12 bits
//! ```
//!
//! `Absolute` entries are padding and are dropped while reading.

use std::{fmt, sync::Arc};

use strum::{Display, EnumIter, FromRepr};

use crate::{
    diagnostics::ErrorListener,
    pe::{DataDirectoryIndex, PeFile},
    segment::{AddressReference, VirtualAddress},
    Result,
};

/// Size of a relocation block header.
pub const RELOCATION_BLOCK_HEADER_SIZE: u32 = 8;

/// How the loader adjusts a relocated location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum RelocationType {
    /// Padding, skipped by the loader.
    Absolute = 0,
    /// High 16 bits of a 32-bit address.
    High = 1,
    /// Low 16 bits of a 32-bit address.
    Low = 2,
    /// A full 32-bit address.
    HighLow = 3,
    /// High 16 bits, with the low half in the next entry.
    HighAdj = 4,
    /// Architecture specific (MIPS JMPADDR, ARM MOV32, RISC-V HIGH20).
    MachineSpecific5 = 5,
    /// Architecture specific (Thumb MOV32, RISC-V LOW12I).
    MachineSpecific7 = 7,
    /// Architecture specific (RISC-V LOW12S).
    MachineSpecific8 = 8,
    /// MIPS16 jump address.
    MipsJmpAddr16 = 9,
    /// A full 64-bit address.
    Dir64 = 10,
}

/// A location the loader patches when the image is not loaded at its preferred base.
#[derive(Clone)]
pub struct BaseRelocation {
    /// Kind of adjustment.
    pub kind: RelocationType,
    /// The patched location.
    pub location: Arc<dyn AddressReference>,
}

impl BaseRelocation {
    /// Creates a relocation.
    #[must_use]
    pub fn new(kind: RelocationType, location: Arc<dyn AddressReference>) -> Self {
        BaseRelocation { kind, location }
    }

    /// Creates a relocation of a fixed RVA.
    #[must_use]
    pub fn at_rva(kind: RelocationType, rva: u32) -> Self {
        Self::new(kind, Arc::new(VirtualAddress(rva)))
    }
}

impl fmt::Debug for BaseRelocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ 0x{:08X}", self.kind, self.location.rva())
    }
}

/// Reads the relocation directory of `file`.
///
/// # Errors
/// Returns whatever `listener` escalates for malformed blocks or unknown entry types.
pub fn read_relocations(file: &PeFile, listener: &dyn ErrorListener) -> Result<Vec<BaseRelocation>> {
    let directory = file.data_directory(DataDirectoryIndex::BaseRelocation);
    if !directory.is_present() || directory.size == 0 {
        return Ok(Vec::new());
    }

    let mut reader = match file.create_reader_at_rva_sized(directory.virtual_address, directory.size) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Relocation directory is not mapped: {error}"))?;
            return Ok(Vec::new());
        }
    };

    let mut relocations = Vec::new();
    while reader.remaining() >= RELOCATION_BLOCK_HEADER_SIZE {
        let page = reader.read_u32()?;
        let size = reader.read_u32()?;
        if size < RELOCATION_BLOCK_HEADER_SIZE || size - RELOCATION_BLOCK_HEADER_SIZE > reader.remaining() {
            listener.bad_image(&format!("Invalid relocation block size {size} for page 0x{page:08X}"))?;
            break;
        }

        for _ in 0..(size - RELOCATION_BLOCK_HEADER_SIZE) / 2 {
            let entry = reader.read_u16()?;
            #[allow(clippy::cast_possible_truncation)]
            let raw_type = (entry >> 12) as u8;
            let rva = page + u32::from(entry & 0x0FFF);

            match RelocationType::from_repr(raw_type) {
                Some(RelocationType::Absolute) => {}
                Some(kind) => relocations.push(BaseRelocation::at_rva(kind, rva)),
                None => listener.bad_image(&format!(
                    "Unknown relocation type {raw_type} at 0x{rva:08X}"
                ))?,
            }
        }
    }

    tracing::debug!(relocations = relocations.len(), "read relocation directory");
    Ok(relocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::{DiagnosticsErrorListener, ThrowErrorListener},
        test::factories::image::{file_with_directory, ImageBytes},
    };

    #[test]
    fn blocks_and_padding() {
        let mut bytes = ImageBytes::new(0x2000);
        bytes.u32(0x1000).u32(12).u16(0x3010).u16(0x0000);
        bytes.u32(0x3000).u32(12).u16(0xA008).u16(0x3FFC);

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::BaseRelocation, 24, true);
        let relocations = read_relocations(&file, &ThrowErrorListener).unwrap();

        let summary: Vec<_> = relocations.iter().map(|r| (r.kind, r.location.rva())).collect();
        assert_eq!(
            summary,
            vec![
                (RelocationType::HighLow, 0x1010),
                (RelocationType::Dir64, 0x3008),
                (RelocationType::HighLow, 0x3FFC),
            ]
        );
        assert!(!relocations[0].location.is_bounded());
    }

    #[test]
    fn truncated_block_is_reported() {
        let mut bytes = ImageBytes::new(0x2000);
        bytes.u32(0x1000).u32(0x100).u16(0x3010);

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::BaseRelocation, 10, true);
        assert!(read_relocations(&file, &ThrowErrorListener).is_err());

        let listener = DiagnosticsErrorListener::new();
        assert!(read_relocations(&file, &listener).unwrap().is_empty());
        assert!(listener.diagnostics().has_errors());
    }
}
