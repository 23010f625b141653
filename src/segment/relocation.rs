//! Placement parameters handed down the segment tree during layout.

use std::fmt;

use crate::utils::{align_up, align_up_u32};

/// Target location of a segment while offsets are being assigned.
///
/// Carries the absolute file offset and RVA the segment is placed at, plus the image-wide
/// values (image base, pointer width) some segments need to emit absolute addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelocationParameters {
    /// Preferred image base of the image being built.
    pub image_base: u64,
    /// Absolute file offset.
    pub offset: u64,
    /// Relative virtual address.
    pub rva: u32,
    /// Whether absolute addresses are 32 bits wide.
    pub is_32bit: bool,
}

impl RelocationParameters {
    /// Creates parameters for a 32-bit image based at 0.
    #[must_use]
    pub fn new(offset: u64, rva: u32) -> Self {
        RelocationParameters {
            image_base: 0,
            offset,
            rva,
            is_32bit: true,
        }
    }

    /// Creates parameters carrying image-wide information.
    #[must_use]
    pub fn with_image(image_base: u64, offset: u64, rva: u32, is_32bit: bool) -> Self {
        RelocationParameters {
            image_base,
            offset,
            rva,
            is_32bit,
        }
    }

    /// Whether absolute addresses are 64 bits wide.
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        !self.is_32bit
    }

    /// Size of an absolute address.
    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        if self.is_32bit {
            4
        } else {
            8
        }
    }

    /// Copies the image-wide values onto a new location.
    #[must_use]
    pub fn with_offset_rva(&self, offset: u64, rva: u32) -> Self {
        RelocationParameters {
            offset,
            rva,
            ..*self
        }
    }

    /// Rounds both coordinates up to a multiple of `alignment`.
    pub fn align(&mut self, alignment: u32) {
        self.offset = align_up(self.offset, u64::from(alignment));
        self.rva = align_up_u32(self.rva, alignment);
    }

    /// Moves both coordinates forward by `count` bytes.
    pub fn advance(&mut self, count: u32) {
        self.advance_split(count, count);
    }

    /// Moves the file offset by `physical` and the RVA by `virtual_count` bytes.
    pub fn advance_split(&mut self, physical: u32, virtual_count: u32) {
        self.offset += u64::from(physical);
        self.rva = self.rva.wrapping_add(virtual_count);
    }

    /// Returns a copy moved forward by `count` bytes.
    #[must_use]
    pub fn with_advance(&self, count: u32) -> Self {
        let mut advanced = *self;
        advanced.advance(count);
        advanced
    }
}

impl fmt::Display for RelocationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImageBase: {:08X}, Offset: {:08X}, Rva: {:08X}",
            self.image_base, self.offset, self.rva
        )
    }
}
