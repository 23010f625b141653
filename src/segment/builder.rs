//! Sequential composite segment.

use super::{RelocationParameters, Segment, SegmentOffsets, SegmentRef};
use crate::{io::BinaryStreamWriter, Result};

/// An ordered list of child segments, each placed at a required alignment.
///
/// When offsets are assigned, each child starts at the previous child's end, rounded up to the
/// child's alignment relative to the builder's own base. Sizes are computed by walking the same
/// placement rules, so padding inserted for alignment is part of the builder's size.
#[derive(Default, Clone)]
pub struct SegmentBuilder {
    items: Vec<(SegmentRef, u32)>,
    offsets: SegmentOffsets,
}

impl SegmentBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `segment`, aligned to `alignment` bytes.
    pub fn add(&mut self, segment: SegmentRef, alignment: u32) {
        self.items.push((segment, alignment.max(1)));
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the builder has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over the children and their alignments.
    pub fn iter(&self) -> impl Iterator<Item = &(SegmentRef, u32)> {
        self.items.iter()
    }

    /// Walks the placement rules from a zero base, returning `(physical, virtual)` extents.
    fn measure(&self) -> (u32, u32) {
        let mut cursor = RelocationParameters::new(0, 0);
        let mut physical_end = 0u64;
        let mut virtual_end = 0u32;

        for (segment, alignment) in &self.items {
            cursor.align(*alignment);
            physical_end = cursor.offset + u64::from(segment.physical_size());
            virtual_end = cursor.rva + segment.virtual_size();
            cursor.advance_split(segment.physical_size(), segment.virtual_size());
        }

        #[allow(clippy::cast_possible_truncation)]
        (physical_end as u32, virtual_end)
    }
}

impl Segment for SegmentBuilder {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);

        let base_offset = parameters.offset;
        let base_rva = parameters.rva;
        let mut cursor = RelocationParameters::new(0, 0);

        for (segment, alignment) in &self.items {
            cursor.align(*alignment);
            segment.update_offsets(
                &parameters.with_offset_rva(base_offset + cursor.offset, base_rva + cursor.rva),
            );
            cursor.advance_split(segment.physical_size(), segment.virtual_size());
        }
    }

    fn physical_size(&self) -> u32 {
        self.measure().0
    }

    fn virtual_size(&self) -> u32 {
        self.measure().1
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let start = writer.offset();
        let mut cursor = RelocationParameters::new(0, 0);

        for (segment, alignment) in &self.items {
            cursor.align(*alignment);
            let target = start + cursor.offset;
            let current = writer.offset();
            if target > current {
                writer.write_zeroes(target - current)?;
            }
            segment.write(writer)?;
            cursor.advance_split(segment.physical_size(), segment.virtual_size());
        }

        Ok(())
    }
}
