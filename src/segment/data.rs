//! Leaf segments.

use std::sync::Arc;

use super::{RelocationParameters, Segment, SegmentOffsets, SegmentRef};
use crate::{
    io::{
        BinaryStreamReader, BinaryStreamWriter, ByteArrayDataSource, DataSource, DataSourceRef,
        DisplacedDataSource,
    },
    Error, Result,
};

/// A segment holding a fixed buffer of bytes.
#[derive(Debug, Clone)]
pub struct DataSegment {
    data: Arc<[u8]>,
    offsets: SegmentOffsets,
}

impl DataSegment {
    /// Creates a segment over `data`, placed at offset and RVA 0.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_location(data, 0, 0)
    }

    /// Creates a segment over `data` that was read from `offset` / `rva`.
    #[must_use]
    pub fn with_location(data: Vec<u8>, offset: u64, rva: u32) -> Self {
        DataSegment {
            data: data.into(),
            offsets: SegmentOffsets::new(offset, rva),
        }
    }

    /// Reads `count` bytes from `reader` into a new segment at the reader's coordinates.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if fewer than `count` bytes remain.
    pub fn from_reader(reader: &mut BinaryStreamReader, count: u32) -> Result<Self> {
        reader.read_segment(count)
    }

    /// The contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Segment for DataSegment {
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
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_bytes(&self.data)
    }

    fn create_reader(&self) -> Option<BinaryStreamReader> {
        let source: DataSourceRef =
            Arc::new(ByteArrayDataSource::from_shared(self.data.clone(), self.offset()));
        BinaryStreamReader::new(source, self.offset(), self.rva(), self.physical_size()).ok()
    }
}

/// A segment that lazily refers to a window of an existing data source.
///
/// The bytes are never copied; writing streams them from the source. When the segment is moved
/// by [`Segment::update_offsets`], readers created from it report the new coordinates while
/// still reading the original bytes.
#[derive(Clone)]
pub struct ReaderSegment {
    reader: BinaryStreamReader,
    offsets: SegmentOffsets,
}

impl ReaderSegment {
    /// Captures the remaining window of `reader`.
    #[must_use]
    pub fn new(reader: BinaryStreamReader) -> Self {
        let offsets = SegmentOffsets::new(reader.offset(), reader.rva());
        let window = reader
            .fork_absolute(reader.offset())
            .unwrap_or_else(|_| reader.clone());
        ReaderSegment {
            reader: window,
            offsets,
        }
    }

    /// Copies the contents into a [`DataSegment`] at the same location.
    ///
    /// # Errors
    /// Returns [`Error::EndOfStream`] if the source cannot serve the window.
    pub fn to_data_segment(&self) -> Result<DataSegment> {
        let mut reader = self.reader.fork();
        let data = reader.read_exact(reader.remaining())?;
        Ok(DataSegment::with_location(data, self.offset(), self.rva()))
    }
}

impl std::fmt::Debug for ReaderSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderSegment")
            .field("offset", &self.offset())
            .field("rva", &self.rva())
            .field("size", &self.physical_size())
            .finish()
    }
}

impl Segment for ReaderSegment {
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
        self.reader.remaining()
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        self.reader.fork().write_to_output(writer)
    }

    fn create_reader(&self) -> Option<BinaryStreamReader> {
        let original = self.reader.offset();
        let current = self.offset();

        let source: DataSourceRef = if original == current {
            self.reader.source().clone()
        } else {
            let displacement = i64::try_from(current).ok()? - i64::try_from(original).ok()?;
            Arc::new(DisplacedDataSource::new(
                self.reader.source().clone(),
                displacement,
            ))
        };

        BinaryStreamReader::new(source, current, self.rva(), self.reader.remaining()).ok()
    }
}

/// A segment of zero bytes.
#[derive(Debug, Clone)]
pub struct ZeroesSegment {
    size: u32,
    offsets: SegmentOffsets,
}

impl ZeroesSegment {
    /// Creates `size` bytes of zero padding.
    #[must_use]
    pub fn new(size: u32) -> Self {
        ZeroesSegment {
            size,
            offsets: SegmentOffsets::default(),
        }
    }
}

impl Segment for ZeroesSegment {
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
        self.size
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_zeroes(u64::from(self.size))
    }
}

/// Wraps a physical segment and extends its mapped size with implicit zeroes.
///
/// Section contents are modelled this way: `SizeOfRawData` bytes on disk, `VirtualSize` bytes in
/// memory. The physical part may be absent entirely (uninitialized data).
#[derive(Clone)]
pub struct VirtualSegment {
    physical: Option<SegmentRef>,
    virtual_size: u32,
    offsets: SegmentOffsets,
}

impl VirtualSegment {
    /// Creates a virtual segment over `physical` with the given mapped size.
    #[must_use]
    pub fn new(physical: Option<SegmentRef>, virtual_size: u32) -> Self {
        let offsets = physical.as_ref().map_or_else(SegmentOffsets::default, |segment| {
            SegmentOffsets::new(segment.offset(), segment.rva())
        });

        VirtualSegment {
            physical,
            virtual_size,
            offsets,
        }
    }

    /// The on-disk part.
    #[must_use]
    pub fn physical_contents(&self) -> Option<&SegmentRef> {
        self.physical.as_ref()
    }

    /// Checks whether `rva` lies inside the mapped extent.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva() && rva - self.rva() < self.virtual_size()
    }
}

impl std::fmt::Debug for VirtualSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSegment")
            .field("offset", &self.offset())
            .field("rva", &self.rva())
            .field("physical_size", &self.physical_size())
            .field("virtual_size", &self.virtual_size)
            .finish()
    }
}

impl Segment for VirtualSegment {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
        if let Some(physical) = &self.physical {
            physical.update_offsets(parameters);
        }
    }

    fn physical_size(&self) -> u32 {
        self.physical
            .as_ref()
            .map_or(0, |segment| segment.physical_size())
    }

    fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        match &self.physical {
            Some(physical) => physical.write(writer),
            None => Ok(()),
        }
    }

    fn create_reader(&self) -> Option<BinaryStreamReader> {
        let physical = match &self.physical {
            Some(segment) => segment.create_reader()?,
            None => {
                let source: DataSourceRef = Arc::new(ZeroTail {
                    inner: None,
                    inner_end: 0,
                    base: self.offset(),
                    length: u64::from(self.virtual_size),
                });
                return BinaryStreamReader::new(source, self.offset(), self.rva(), self.virtual_size)
                    .ok();
            }
        };

        if self.virtual_size <= physical.length() {
            return Some(physical);
        }

        let source: DataSourceRef = Arc::new(ZeroTail {
            inner: Some(physical.source().clone()),
            inner_end: physical.end_offset(),
            base: physical.start_offset(),
            length: u64::from(self.virtual_size),
        });
        BinaryStreamReader::new(source, physical.start_offset(), physical.start_rva(), self.virtual_size)
            .ok()
    }
}

/// Serves the backing source up to `inner_end` and zeroes up to `base + length`.
struct ZeroTail {
    inner: Option<DataSourceRef>,
    inner_end: u64,
    base: u64,
    length: u64,
}

impl DataSource for ZeroTail {
    fn base_address(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if !self.is_valid_address(address) {
            return Err(Error::AddressOutOfRange(address));
        }

        let end = self.base + self.length;
        let count = usize::try_from(end - address)
            .map_or(buffer.len(), |available| available.min(buffer.len()));

        let served = match &self.inner {
            Some(inner) if address < self.inner_end && inner.is_valid_address(address) => {
                let backed = usize::try_from(self.inner_end - address)
                    .map_or(count, |available| available.min(count));
                inner.read_bytes(address, &mut buffer[..backed])?
            }
            _ => 0,
        };

        buffer[served..count].fill(0);
        Ok(count)
    }
}
