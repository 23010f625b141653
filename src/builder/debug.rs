//! Debug directory.

use std::sync::Arc;

use crate::{
    image::{DebugDataEntry, DEBUG_DIRECTORY_ENTRY_SIZE},
    io::BinaryStreamWriter,
    segment::{RelocationParameters, Segment, SegmentBuilder, SegmentOffsets, SegmentRef},
    utils::to_u32,
    Result,
};

/// The table of debug directory entries.
///
/// The contents each entry points at are collected into [`DebugDirectoryBuffer::contents`],
/// which has to be placed separately. Entries without contents are written with zero
/// addresses.
pub struct DebugDirectoryBuffer {
    entries: Vec<DebugDataEntry>,
    contents: Arc<SegmentBuilder>,
    offsets: SegmentOffsets,
}

impl DebugDirectoryBuffer {
    /// Creates the table for `entries`.
    #[must_use]
    pub fn new(entries: Vec<DebugDataEntry>) -> Self {
        let mut contents = SegmentBuilder::new();
        for entry in &entries {
            if let Some(data) = &entry.contents {
                contents.add(Arc::clone(data), 4);
            }
        }
        DebugDirectoryBuffer {
            entries,
            contents: Arc::new(contents),
            offsets: SegmentOffsets::default(),
        }
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The data blobs referenced by the entries.
    #[must_use]
    pub fn contents(&self) -> SegmentRef {
        self.contents.clone()
    }
}

impl Segment for DebugDirectoryBuffer {
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
        to_u32(self.entries.len()).unwrap_or(0) * DEBUG_DIRECTORY_ENTRY_SIZE
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        for entry in &self.entries {
            writer.write_u32(entry.characteristics)?;
            writer.write_u32(entry.time_date_stamp)?;
            writer.write_u16(entry.major_version)?;
            writer.write_u16(entry.minor_version)?;
            writer.write_u32(entry.kind)?;
            match &entry.contents {
                Some(data) => {
                    writer.write_u32(data.physical_size())?;
                    writer.write_u32(data.rva())?;
                    writer.write_u32(u32::try_from(data.offset()).unwrap_or(0))?;
                }
                None => writer.write_zeroes(12)?,
            }
        }
        Ok(())
    }
}
