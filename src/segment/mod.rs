//! Layout units of an output image.
//!
//! A [`Segment`] is anything that has a physical size (bytes on disk), a virtual size (bytes once
//! mapped), a location that can be reassigned, and knows how to write itself. Sections,
//! directories, method bodies and the tables in between are all segments; composite layouts are
//! expressed with a [`SegmentBuilder`].
//!
//! Layout happens in two phases:
//!
//! 1. [`Segment::update_offsets`] is called once on the root of a segment tree with the target
//!    file offset and RVA. Composites propagate the call to their children at their aligned
//!    positions.
//! 2. [`Segment::write`] is called on the root with a writer positioned at the root's offset.
//!
//! Segments are shared as [`SegmentRef`] (`Arc<dyn Segment>`) because other segments need to
//! read their final location: an import address table entry, a relocation, a data directory
//! all point at "wherever that segment ended up". For this reason locations are stored in a
//! [`SegmentOffsets`] cell and updated through `&self`.
//!
//! ```rust
//! use std::sync::Arc;
//! use peweave::segment::{DataSegment, RelocationParameters, Segment, SegmentBuilder};
//!
//! let mut builder = SegmentBuilder::new();
//! builder.add(Arc::new(DataSegment::new(vec![1, 2, 3])), 1);
//! builder.add(Arc::new(DataSegment::new(vec![4])), 4);
//!
//! builder.update_offsets(&RelocationParameters::new(0x400, 0x2000));
//! assert_eq!(builder.physical_size(), 5);
//! assert_eq!(builder.to_bytes()?, vec![1, 2, 3, 0, 4]);
//! # Ok::<(), peweave::Error>(())
//! ```

mod builder;
mod data;
mod patched;
mod reference;
mod relocation;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

pub use builder::SegmentBuilder;
pub use data::{DataSegment, ReaderSegment, VirtualSegment, ZeroesSegment};
pub use patched::{AddressFixupKind, Patch, PatchedSegment};
pub use reference::{AddressReference, SegmentReference, VirtualAddress};
pub use relocation::RelocationParameters;

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    Result,
};

/// A shared handle to a segment.
pub type SegmentRef = Arc<dyn Segment>;

/// A unit of layout in an output image.
pub trait Segment: Send + Sync {
    /// Absolute file offset assigned by the last [`Segment::update_offsets`].
    fn offset(&self) -> u64;

    /// RVA assigned by the last [`Segment::update_offsets`].
    fn rva(&self) -> u32;

    /// Whether the location of this segment can be reassigned.
    fn can_update_offsets(&self) -> bool {
        true
    }

    /// Assigns a new location to this segment (and its children).
    fn update_offsets(&self, parameters: &RelocationParameters);

    /// Number of bytes the segment occupies on disk.
    fn physical_size(&self) -> u32;

    /// Number of bytes the segment occupies once mapped.
    fn virtual_size(&self) -> u32 {
        self.physical_size()
    }

    /// Serializes the segment at the writer's current position.
    ///
    /// # Errors
    /// Returns an error if the writer rejects the data or the contents cannot be serialized.
    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()>;

    /// Creates a reader over the physical contents, in this segment's current coordinates.
    ///
    /// Returns `None` for segments that are only produced on write.
    fn create_reader(&self) -> Option<BinaryStreamReader> {
        None
    }

    /// Serializes the segment into a new buffer.
    ///
    /// # Errors
    /// Returns an error if the contents cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = MemoryStreamWriter::with_capacity(self.physical_size() as usize);
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }
}

/// Interior-mutable storage for a segment's location.
#[derive(Debug, Default)]
pub struct SegmentOffsets {
    offset: AtomicU64,
    rva: AtomicU32,
}

impl SegmentOffsets {
    /// Creates a location cell.
    #[must_use]
    pub fn new(offset: u64, rva: u32) -> Self {
        SegmentOffsets {
            offset: AtomicU64::new(offset),
            rva: AtomicU32::new(rva),
        }
    }

    /// Current file offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Current RVA.
    #[must_use]
    pub fn rva(&self) -> u32 {
        self.rva.load(Ordering::Acquire)
    }

    /// Stores the location described by `parameters`.
    pub fn update(&self, parameters: &RelocationParameters) {
        self.offset.store(parameters.offset, Ordering::Release);
        self.rva.store(parameters.rva, Ordering::Release);
    }
}

impl Clone for SegmentOffsets {
    fn clone(&self) -> Self {
        SegmentOffsets::new(self.offset(), self.rva())
    }
}

/// Physical size of an optional segment, 0 when absent.
#[must_use]
pub fn size_of(segment: Option<&SegmentRef>) -> u32 {
    segment.map_or(0, |segment| segment.physical_size())
}
