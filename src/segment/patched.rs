//! Segments with bytes overwritten at write time.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::{AddressReference, RelocationParameters, Segment, SegmentOffsets, SegmentRef};
use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    Error, Result,
};

/// How an address is encoded by an [`Patch::AddressFixup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFixupKind {
    /// 32-bit virtual address (image base + RVA).
    Absolute32,
    /// 64-bit virtual address (image base + RVA).
    Absolute64,
    /// 32-bit RVA.
    Rva32,
    /// 32-bit displacement relative to the end of the fixup.
    Relative32,
}

impl AddressFixupKind {
    /// Number of bytes the fixup overwrites.
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            AddressFixupKind::Absolute64 => 8,
            _ => 4,
        }
    }
}

/// A modification applied to a segment's bytes after they are rendered.
#[derive(Clone)]
pub enum Patch {
    /// Overwrites bytes with a fixed buffer.
    Bytes {
        /// Position relative to the start of the patched segment.
        relative_offset: u32,
        /// Replacement bytes.
        data: Vec<u8>,
    },
    /// Overwrites bytes with the serialization of another segment, which is placed there.
    Segment {
        /// Position relative to the start of the patched segment.
        relative_offset: u32,
        /// Replacement segment.
        segment: SegmentRef,
    },
    /// Writes the final address of a symbol.
    AddressFixup {
        /// Position relative to the start of the patched segment.
        relative_offset: u32,
        /// Encoding of the address.
        kind: AddressFixupKind,
        /// The referenced location.
        symbol: Arc<dyn AddressReference>,
    },
}

impl Patch {
    fn relative_offset(&self) -> u32 {
        match self {
            Patch::Bytes {
                relative_offset, ..
            }
            | Patch::Segment {
                relative_offset, ..
            }
            | Patch::AddressFixup {
                relative_offset, ..
            } => *relative_offset,
        }
    }
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Bytes {
                relative_offset,
                data,
            } => write!(f, "Bytes(+0x{relative_offset:X}, {} bytes)", data.len()),
            Patch::Segment {
                relative_offset,
                segment,
            } => write!(
                f,
                "Segment(+0x{relative_offset:X}, {} bytes)",
                segment.physical_size()
            ),
            Patch::AddressFixup {
                relative_offset,
                kind,
                symbol,
            } => write!(
                f,
                "AddressFixup(+0x{relative_offset:X}, {kind:?}, 0x{:08X})",
                symbol.rva()
            ),
        }
    }
}

/// Wraps a segment and applies a list of patches whenever it is written.
///
/// The wrapped segment keeps its size; patches may not extend past its end.
pub struct PatchedSegment {
    contents: SegmentRef,
    patches: Vec<Patch>,
    image_base: AtomicU64,
    offsets: SegmentOffsets,
}

impl PatchedSegment {
    /// Wraps `contents` without any patches.
    #[must_use]
    pub fn new(contents: SegmentRef) -> Self {
        let offsets = SegmentOffsets::new(contents.offset(), contents.rva());
        PatchedSegment {
            contents,
            patches: Vec::new(),
            image_base: AtomicU64::new(0),
            offsets,
        }
    }

    /// The unpatched segment.
    #[must_use]
    pub fn contents(&self) -> &SegmentRef {
        &self.contents
    }

    /// The registered patches.
    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Registers a patch.
    pub fn add(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    /// Registers a patch, builder style.
    #[must_use]
    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.add(patch);
        self
    }

    /// Overwrites the `u32` at `relative_offset` with the RVA of `symbol`.
    #[must_use]
    pub fn with_rva(self, relative_offset: u32, symbol: Arc<dyn AddressReference>) -> Self {
        self.with_patch(Patch::AddressFixup {
            relative_offset,
            kind: AddressFixupKind::Rva32,
            symbol,
        })
    }

    fn apply(&self, buffer: &mut [u8], patch: &Patch) -> Result<()> {
        let relative_offset = patch.relative_offset() as usize;

        let data = match patch {
            Patch::Bytes { data, .. } => data.clone(),
            Patch::Segment { segment, .. } => segment.to_bytes()?,
            Patch::AddressFixup { kind, symbol, .. } => {
                let image_base = self.image_base.load(Ordering::Acquire);
                let target = symbol.rva();
                match kind {
                    AddressFixupKind::Rva32 => target.to_le_bytes().to_vec(),
                    AddressFixupKind::Absolute32 => {
                        let address = image_base + u64::from(target);
                        let address = u32::try_from(address).map_err(|_| {
                            Error::InvalidArgument(format!(
                                "Address 0x{address:X} does not fit an absolute 32-bit fixup"
                            ))
                        })?;
                        address.to_le_bytes().to_vec()
                    }
                    AddressFixupKind::Absolute64 => {
                        (image_base + u64::from(target)).to_le_bytes().to_vec()
                    }
                    AddressFixupKind::Relative32 => {
                        let origin = self
                            .rva()
                            .wrapping_add(patch.relative_offset())
                            .wrapping_add(4);
                        #[allow(clippy::cast_possible_wrap)]
                        let displacement = target.wrapping_sub(origin) as i32;
                        displacement.to_le_bytes().to_vec()
                    }
                }
            }
        };

        let end = relative_offset + data.len();
        if end > buffer.len() {
            return Err(Error::InvalidArgument(format!(
                "Patch at +0x{relative_offset:X} ({} bytes) exceeds segment of {} bytes",
                data.len(),
                buffer.len()
            )));
        }
        buffer[relative_offset..end].copy_from_slice(&data);
        Ok(())
    }
}

impl fmt::Debug for PatchedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchedSegment")
            .field("offset", &self.offset())
            .field("rva", &self.rva())
            .field("size", &self.physical_size())
            .field("patches", &self.patches)
            .finish()
    }
}

impl Segment for PatchedSegment {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
        self.image_base.store(parameters.image_base, Ordering::Release);
        self.contents.update_offsets(parameters);

        for patch in &self.patches {
            if let Patch::Segment {
                relative_offset,
                segment,
            } = patch
            {
                segment.update_offsets(&parameters.with_advance(*relative_offset));
            }
        }
    }

    fn physical_size(&self) -> u32 {
        self.contents.physical_size()
    }

    fn virtual_size(&self) -> u32 {
        self.contents.virtual_size()
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let mut buffer = MemoryStreamWriter::with_capacity(self.physical_size() as usize);
        self.contents.write(&mut buffer)?;
        let mut data = buffer.into_inner();

        for patch in &self.patches {
            self.apply(&mut data, patch)?;
        }

        writer.write_bytes(&data)
    }

    fn create_reader(&self) -> Option<BinaryStreamReader> {
        let data = self.to_bytes().ok()?;
        let source: crate::io::DataSourceRef = Arc::new(
            crate::io::ByteArrayDataSource::with_base(data, self.offset()),
        );
        BinaryStreamReader::new(source, self.offset(), self.rva(), self.physical_size()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{DataSegment, SegmentReference, VirtualAddress};

    #[test]
    fn bytes_and_rva_patches() {
        let target: SegmentRef = Arc::new(DataSegment::new(vec![0; 4]));
        let patched = PatchedSegment::new(Arc::new(DataSegment::new(vec![0xAA; 12])))
            .with_patch(Patch::Bytes {
                relative_offset: 0,
                data: vec![1, 2],
            })
            .with_rva(4, Arc::new(SegmentReference::new(target.clone())));

        target.update_offsets(&RelocationParameters::new(0x600, 0x3010));
        patched.update_offsets(&RelocationParameters::new(0x400, 0x2000));

        let bytes = patched.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[1, 2, 0xAA, 0xAA]);
        assert_eq!(&bytes[4..8], &0x3010u32.to_le_bytes());
        assert_eq!(&bytes[8..], &[0xAA; 4]);
    }

    #[test]
    fn absolute_and_relative_fixups() {
        let patched = PatchedSegment::new(Arc::new(DataSegment::new(vec![0; 16])))
            .with_patch(Patch::AddressFixup {
                relative_offset: 0,
                kind: AddressFixupKind::Absolute32,
                symbol: Arc::new(VirtualAddress(0x2000)),
            })
            .with_patch(Patch::AddressFixup {
                relative_offset: 4,
                kind: AddressFixupKind::Relative32,
                symbol: Arc::new(VirtualAddress(0x1000)),
            })
            .with_patch(Patch::AddressFixup {
                relative_offset: 8,
                kind: AddressFixupKind::Absolute64,
                symbol: Arc::new(VirtualAddress(0x10)),
            });

        patched.update_offsets(&RelocationParameters::with_image(0x40_0000, 0x200, 0x1000, true));
        let bytes = patched.to_bytes().unwrap();

        assert_eq!(&bytes[0..4], &0x0040_2000u32.to_le_bytes());
        // 0x1000 - (0x1000 + 4 + 4)
        assert_eq!(&bytes[4..8], &(-8i32).to_le_bytes());
        assert_eq!(&bytes[8..16], &0x40_0010u64.to_le_bytes());
    }

    #[test]
    fn segment_patch_is_placed() {
        let replacement: SegmentRef = Arc::new(DataSegment::new(vec![9, 9]));
        let patched = PatchedSegment::new(Arc::new(DataSegment::new(vec![0; 8]))).with_patch(
            Patch::Segment {
                relative_offset: 6,
                segment: replacement.clone(),
            },
        );
        patched.update_offsets(&RelocationParameters::new(0x400, 0x2000));

        assert_eq!(replacement.rva(), 0x2006);
        assert_eq!(patched.to_bytes().unwrap(), vec![0, 0, 0, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn patch_past_end_is_rejected() {
        let patched = PatchedSegment::new(Arc::new(DataSegment::new(vec![0; 2]))).with_patch(
            Patch::Bytes {
                relative_offset: 1,
                data: vec![1, 2],
            },
        );
        assert!(patched.to_bytes().is_err());
    }
}
