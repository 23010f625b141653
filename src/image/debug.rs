//! Debug directory entries.

use std::sync::Arc;

use strum::{Display, EnumIter, FromRepr};

use crate::{
    diagnostics::ErrorListener,
    pe::{DataDirectoryIndex, MappingMode, PeFile},
    segment::{Segment, SegmentRef},
    Error, Result,
};

/// Size of one debug directory entry.
pub const DEBUG_DIRECTORY_ENTRY_SIZE: u32 = 28;

/// Format of the data referenced by a debug directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum DebugDataType {
    Unknown = 0,
    Coff = 1,
    CodeView = 2,
    Fpo = 3,
    Misc = 4,
    Exception = 5,
    Fixup = 6,
    OmapToSrc = 7,
    OmapFromSrc = 8,
    Borland = 9,
    Clsid = 11,
    VcFeature = 12,
    Pogo = 13,
    Iltcg = 14,
    Mpx = 15,
    Repro = 16,
    EmbeddedPortablePdb = 17,
    PdbChecksum = 19,
    ExDllCharacteristics = 20,
}

/// One entry of the debug directory with its raw contents.
#[derive(Clone)]
pub struct DebugDataEntry {
    /// Reserved, usually 0.
    pub characteristics: u32,
    /// Creation time stamp.
    pub time_date_stamp: u32,
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// Raw format value; see [`DebugDataEntry::data_type`].
    pub kind: u32,
    /// The referenced data, `None` when the entry has no contents.
    pub contents: Option<SegmentRef>,
}

impl DebugDataEntry {
    /// Creates an entry of the given format.
    #[must_use]
    pub fn new(kind: DebugDataType, contents: Option<SegmentRef>) -> Self {
        DebugDataEntry {
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            kind: kind as u32,
            contents,
        }
    }

    /// The format, if it is a known one.
    #[must_use]
    pub fn data_type(&self) -> Option<DebugDataType> {
        DebugDataType::from_repr(self.kind)
    }
}

impl std::fmt::Debug for DebugDataEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugDataEntry")
            .field("kind", &self.kind)
            .field("size", &self.contents.as_ref().map(|c| c.physical_size()))
            .finish_non_exhaustive()
    }
}

/// Reads the debug directory of `file`.
///
/// Contents are located through `AddressOfRawData`, falling back to `PointerToRawData` for
/// data that is not mapped (unmapped files only).
///
/// # Errors
/// Returns whatever `listener` escalates for unreadable contents.
pub fn read_debug_entries(file: &PeFile, listener: &dyn ErrorListener) -> Result<Vec<DebugDataEntry>> {
    let directory = file.data_directory(DataDirectoryIndex::Debug);
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let mut reader = match file.create_reader_at_rva_sized(directory.virtual_address, directory.size) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Debug directory is not mapped: {error}"))?;
            return Ok(Vec::new());
        }
    };

    let mut entries = Vec::new();
    while reader.remaining() >= DEBUG_DIRECTORY_ENTRY_SIZE {
        let characteristics = reader.read_u32()?;
        let time_date_stamp = reader.read_u32()?;
        let major_version = reader.read_u16()?;
        let minor_version = reader.read_u16()?;
        let kind = reader.read_u32()?;
        let size = reader.read_u32()?;
        let address = reader.read_u32()?;
        let pointer = reader.read_u32()?;

        let contents = if size == 0 {
            None
        } else {
            let contents = if address != 0 {
                file.create_reader_at_rva_sized(address, size)
            } else if file.mapping_mode() == MappingMode::Unmapped && pointer != 0 {
                file.create_reader_at_offset(u64::from(pointer))
                    .and_then(|r| r.fork_absolute_sized(u64::from(pointer), size))
            } else {
                Err(Error::AddressOutOfRange(u64::from(pointer)))
            };

            match contents.and_then(|mut r| r.read_segment(size)) {
                Ok(segment) => Some(Arc::new(segment) as SegmentRef),
                Err(error) => {
                    listener.bad_image(&format!("Invalid debug data of type {kind}: {error}"))?;
                    None
                }
            }
        };

        entries.push(DebugDataEntry {
            characteristics,
            time_date_stamp,
            major_version,
            minor_version,
            kind,
            contents,
        });
    }

    tracing::debug!(entries = entries.len(), "read debug directory");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::ThrowErrorListener,
        test::factories::image::{file_with_directory, ImageBytes},
    };

    #[test]
    fn codeview_entry() {
        let mut bytes = ImageBytes::new(0x2000);
        bytes
            .u32(0)
            .u32(0x5F00_0000)
            .u16(0)
            .u16(0)
            .u32(DebugDataType::CodeView as u32)
            .u32(8)
            .u32(0x2040)
            .u32(0);
        bytes
            .u32(0)
            .u32(0)
            .u16(0)
            .u16(0)
            .u32(DebugDataType::Repro as u32)
            .u32(0)
            .u32(0)
            .u32(0);
        bytes.seek(0x40).bytes(b"RSDS").u32(7);

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::Debug, 56, true);
        let entries = read_debug_entries(&file, &ThrowErrorListener).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data_type(), Some(DebugDataType::CodeView));
        assert_eq!(entries[0].time_date_stamp, 0x5F00_0000);
        let contents = entries[0].contents.as_ref().unwrap().to_bytes().unwrap();
        assert_eq!(&contents[..4], b"RSDS");
        assert_eq!(entries[1].data_type(), Some(DebugDataType::Repro));
        assert!(entries[1].contents.is_none());
    }
}
