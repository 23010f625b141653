//! Base relocation directory.
//!
//! Blocks are derived from the relocation targets every time the segment is measured or
//! written, since the targets only have their final RVAs after layout. The directory is
//! placed in the last section so that its own size cannot shift any target.

use std::collections::BTreeMap;

use crate::{
    image::{BaseRelocation, RelocationType, RELOCATION_BLOCK_HEADER_SIZE},
    io::BinaryStreamWriter,
    segment::{RelocationParameters, Segment, SegmentOffsets},
    utils::to_u32,
    Result,
};

/// The serialized `.reloc` contents.
pub struct RelocationDirectoryBuffer {
    relocations: Vec<BaseRelocation>,
    offsets: SegmentOffsets,
}

impl RelocationDirectoryBuffer {
    /// Creates the directory for `relocations`.
    #[must_use]
    pub fn new(relocations: Vec<BaseRelocation>) -> Self {
        RelocationDirectoryBuffer {
            relocations,
            offsets: SegmentOffsets::default(),
        }
    }

    /// Whether there are no relocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relocations.is_empty()
    }

    /// Entries grouped by page, each block padded to an even entry count.
    fn blocks(&self) -> BTreeMap<u32, Vec<u16>> {
        let mut blocks: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for relocation in &self.relocations {
            let rva = relocation.location.rva();
            #[allow(clippy::cast_possible_truncation)]
            let entry = (u16::from(relocation.kind as u8) << 12) | (rva & 0x0FFF) as u16;
            blocks.entry(rva & !0x0FFF).or_default().push(entry);
        }

        for entries in blocks.values_mut() {
            entries.sort_unstable_by_key(|entry| entry & 0x0FFF);
            if entries.len() % 2 != 0 {
                entries.push(u16::from(RelocationType::Absolute as u8) << 12);
            }
        }
        blocks
    }
}

impl Segment for RelocationDirectoryBuffer {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
    }

    fn physical_size(&self) -> u32 {
        self.blocks()
            .values()
            .map(|entries| RELOCATION_BLOCK_HEADER_SIZE + 2 * to_u32(entries.len()).unwrap_or(0))
            .sum()
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        for (page, entries) in self.blocks() {
            writer.write_u32(page)?;
            writer.write_u32(RELOCATION_BLOCK_HEADER_SIZE + 2 * to_u32(entries.len())?)?;
            for entry in entries {
                writer.write_u16(entry)?;
            }
        }
        Ok(())
    }
}
