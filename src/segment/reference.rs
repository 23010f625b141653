//! References to locations that are only known after layout.

use std::fmt;

use super::SegmentRef;

/// Something that resolves to an RVA once the image is laid out.
///
/// Symbols, import thunks, relocation targets and entry points are all address references:
/// they are created while building and only read after [`super::Segment::update_offsets`] has
/// placed every segment.
pub trait AddressReference: Send + Sync {
    /// The current RVA of the referenced location.
    fn rva(&self) -> u32;

    /// Whether the reference points into a segment (as opposed to a fixed address).
    fn is_bounded(&self) -> bool {
        false
    }
}

/// A location inside a segment: the segment's RVA plus a fixed displacement.
#[derive(Clone)]
pub struct SegmentReference {
    segment: SegmentRef,
    additive: u32,
}

impl SegmentReference {
    /// References the start of `segment`.
    #[must_use]
    pub fn new(segment: SegmentRef) -> Self {
        Self::with_offset(segment, 0)
    }

    /// References `segment` displaced by `additive` bytes.
    #[must_use]
    pub fn with_offset(segment: SegmentRef, additive: u32) -> Self {
        SegmentReference { segment, additive }
    }

    /// The referenced segment.
    #[must_use]
    pub fn segment(&self) -> &SegmentRef {
        &self.segment
    }

    /// Displacement from the start of the segment.
    #[must_use]
    pub fn additive(&self) -> u32 {
        self.additive
    }
}

impl AddressReference for SegmentReference {
    fn rva(&self) -> u32 {
        self.segment.rva().wrapping_add(self.additive)
    }

    fn is_bounded(&self) -> bool {
        true
    }
}

impl fmt::Debug for SegmentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentReference(0x{:08X})", self.rva())
    }
}

/// A fixed RVA, not tied to any segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress(pub u32);

impl AddressReference for VirtualAddress {
    fn rva(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::segment::{DataSegment, RelocationParameters, Segment};

    #[test]
    fn segment_reference_tracks_layout() {
        let segment: SegmentRef = Arc::new(DataSegment::new(vec![0; 16]));
        let reference = SegmentReference::with_offset(segment.clone(), 8);

        segment.update_offsets(&RelocationParameters::new(0x200, 0x2000));
        assert_eq!(reference.rva(), 0x2008);

        segment.update_offsets(&RelocationParameters::new(0x400, 0x4000));
        assert_eq!(reference.rva(), 0x4008);
        assert!(reference.is_bounded());
        assert!(!VirtualAddress(0x1000).is_bounded());
    }
}
