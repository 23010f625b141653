//! Win32 resource tree.
//!
//! The resource directory is a tree of tables. Every table starts with a 16-byte header followed
//! by 8-byte entries, named entries first. An entry either points to another table (high bit of
//! its offset set) or to a 16-byte data entry holding the RVA and size of the contents. All
//! offsets inside the tree are relative to the start of the directory.

use std::{fmt, sync::Arc};

use crate::{
    diagnostics::ErrorListener,
    io::BinaryStreamReader,
    pe::{DataDirectoryIndex, PeFile},
    segment::{Segment, SegmentRef},
    Result,
};

/// Size of a resource table header.
pub const RESOURCE_TABLE_SIZE: u32 = 16;
/// Size of a resource table entry.
pub const RESOURCE_ENTRY_SIZE: u32 = 8;
/// Size of a resource data entry.
pub const RESOURCE_DATA_ENTRY_SIZE: u32 = 16;

/// Trees nested deeper than this are treated as malformed.
pub const MAX_RESOURCE_DEPTH: usize = 16;

/// Name or numeric id of a resource table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceIdentifier {
    /// Named entry.
    Name(String),
    /// Numeric entry.
    Id(u32),
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceIdentifier::Name(name) => write!(f, "\"{name}\""),
            ResourceIdentifier::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// A leaf of the resource tree.
#[derive(Clone)]
pub struct ResourceData {
    /// Identifier of the entry.
    pub identifier: ResourceIdentifier,
    /// The resource bytes.
    pub contents: SegmentRef,
    /// Code page used to decode the contents, usually 0.
    pub code_page: u32,
}

impl fmt::Debug for ResourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceData")
            .field("identifier", &self.identifier)
            .field("size", &self.contents.physical_size())
            .field("code_page", &self.code_page)
            .finish()
    }
}

/// A node of the resource tree.
#[derive(Debug, Clone)]
pub enum ResourceEntry {
    /// A nested table.
    Directory(ResourceDirectory),
    /// A leaf.
    Data(ResourceData),
}

impl ResourceEntry {
    /// Identifier of the entry.
    #[must_use]
    pub fn identifier(&self) -> &ResourceIdentifier {
        match self {
            ResourceEntry::Directory(directory) => &directory.identifier,
            ResourceEntry::Data(data) => &data.identifier,
        }
    }
}

/// A resource table.
#[derive(Debug, Clone)]
pub struct ResourceDirectory {
    /// Identifier of the table in its parent; the root uses id 0.
    pub identifier: ResourceIdentifier,
    /// Reserved flags.
    pub characteristics: u32,
    /// Creation time stamp.
    pub time_date_stamp: u32,
    /// Major version.
    pub major_version: u16,
    /// Minor version.
    pub minor_version: u16,
    /// Child entries in table order.
    pub entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    /// Creates an empty table.
    #[must_use]
    pub fn new(identifier: ResourceIdentifier) -> Self {
        ResourceDirectory {
            identifier,
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            entries: Vec::new(),
        }
    }

    /// Finds a child by identifier.
    #[must_use]
    pub fn entry(&self, identifier: &ResourceIdentifier) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.identifier() == identifier)
    }

    /// Number of leaves in this subtree.
    #[must_use]
    pub fn data_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry {
                ResourceEntry::Directory(directory) => directory.data_count(),
                ResourceEntry::Data(_) => 1,
            })
            .sum()
    }
}

struct ResourceReader<'a> {
    file: &'a PeFile,
    root: BinaryStreamReader,
    listener: &'a dyn ErrorListener,
}

impl ResourceReader<'_> {
    fn at(&self, offset: u32) -> Result<BinaryStreamReader> {
        self.root.fork_relative(u64::from(offset))
    }

    fn read_identifier(&self, raw: u32) -> Result<ResourceIdentifier> {
        if raw & 0x8000_0000 == 0 {
            return Ok(ResourceIdentifier::Id(raw));
        }
        let name = self.at(raw & 0x7FFF_FFFF)?.read_prefixed_unicode_string()?;
        Ok(ResourceIdentifier::Name(name))
    }

    fn read_directory(
        &self,
        identifier: ResourceIdentifier,
        offset: u32,
        depth: usize,
    ) -> Result<ResourceDirectory> {
        let mut reader = self.at(offset)?;
        let mut directory = ResourceDirectory::new(identifier);
        directory.characteristics = reader.read_u32()?;
        directory.time_date_stamp = reader.read_u32()?;
        directory.major_version = reader.read_u16()?;
        directory.minor_version = reader.read_u16()?;
        let count = u32::from(reader.read_u16()?) + u32::from(reader.read_u16()?);

        if depth >= MAX_RESOURCE_DEPTH {
            self.listener.bad_image(&format!(
                "Resource tree exceeds the maximum depth of {MAX_RESOURCE_DEPTH}"
            ))?;
            return Ok(directory);
        }

        for _ in 0..count {
            let raw_identifier = reader.read_u32()?;
            let raw_offset = reader.read_u32()?;

            let identifier = match self.read_identifier(raw_identifier) {
                Ok(identifier) => identifier,
                Err(error) => {
                    self.listener.bad_image(&format!("Invalid resource name: {error}"))?;
                    continue;
                }
            };

            if raw_offset & 0x8000_0000 != 0 {
                let child = self.read_directory(identifier, raw_offset & 0x7FFF_FFFF, depth + 1)?;
                directory.entries.push(ResourceEntry::Directory(child));
            } else if let Some(data) = self.read_data(identifier, raw_offset)? {
                directory.entries.push(ResourceEntry::Data(data));
            }
        }

        Ok(directory)
    }

    fn read_data(&self, identifier: ResourceIdentifier, offset: u32) -> Result<Option<ResourceData>> {
        let mut entry = self.at(offset)?;
        let rva = entry.read_u32()?;
        let size = entry.read_u32()?;
        let code_page = entry.read_u32()?;

        let contents = self
            .file
            .create_reader_at_rva_sized(rva, size)
            .and_then(|mut reader| reader.read_segment(size));
        match contents {
            Ok(contents) => Ok(Some(ResourceData {
                identifier,
                contents: Arc::new(contents),
                code_page,
            })),
            Err(error) => {
                self.listener
                    .bad_image(&format!("Invalid resource data at RVA 0x{rva:08X}: {error}"))?;
                Ok(None)
            }
        }
    }
}

/// Reads the resource directory of `file`.
///
/// # Errors
/// Returns [`crate::Error::EndOfStream`] for truncated tables, or whatever `listener`
/// escalates for unreadable leaves and trees nested too deep.
pub fn read_resources(file: &PeFile, listener: &dyn ErrorListener) -> Result<Option<ResourceDirectory>> {
    let directory = file.data_directory(DataDirectoryIndex::Resource);
    if !directory.is_present() {
        return Ok(None);
    }

    let root = match file.create_reader_at_rva(directory.virtual_address) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Resource directory is not mapped: {error}"))?;
            return Ok(None);
        }
    };

    let reader = ResourceReader {
        file,
        root,
        listener,
    };
    let tree = reader.read_directory(ResourceIdentifier::Id(0), 0, 0)?;
    tracing::debug!(leaves = tree.data_count(), "read resource directory");
    Ok(Some(tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::{DiagnosticsErrorListener, ThrowErrorListener},
        test::factories::image::{file_with_directory, ImageBytes},
    };

    fn table(bytes: &mut ImageBytes, named: u16, ids: u16) {
        bytes.u32(0).u32(0).u16(4).u16(0).u16(named).u16(ids);
    }

    #[test]
    fn type_name_language_tree() {
        let mut bytes = ImageBytes::new(0x2000);
        // root: id 16 -> table at 0x18
        table(&mut bytes, 0, 1);
        bytes.u32(16).u32(0x8000_0018);
        // 0x18: name "VER" -> table at 0x30
        table(&mut bytes, 1, 0);
        bytes.u32(0x8000_0060).u32(0x8000_0030);
        // 0x30: id 1033 -> data entry at 0x48
        table(&mut bytes, 0, 1);
        bytes.u32(1033).u32(0x48);
        // 0x48: data entry
        bytes.u32(0x2080).u32(4).u32(1252).u32(0);
        bytes.seek(0x60).u16(3).utf16("VER");
        bytes.seek(0x80).bytes(&[1, 2, 3, 4]);

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::Resource, 0x84, true);
        let root = read_resources(&file, &ThrowErrorListener).unwrap().unwrap();

        assert_eq!(root.data_count(), 1);
        let Some(ResourceEntry::Directory(version)) = root.entry(&ResourceIdentifier::Id(16)) else {
            panic!("expected a type table");
        };
        assert_eq!(version.major_version, 4);
        let Some(ResourceEntry::Directory(named)) =
            version.entry(&ResourceIdentifier::Name("VER".to_string()))
        else {
            panic!("expected a name table");
        };
        let Some(ResourceEntry::Data(data)) = named.entry(&ResourceIdentifier::Id(1033)) else {
            panic!("expected a leaf");
        };
        assert_eq!(data.code_page, 1252);
        assert_eq!(data.contents.to_bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn self_referencing_tree_is_cut() {
        let mut bytes = ImageBytes::new(0x2000);
        table(&mut bytes, 0, 1);
        bytes.u32(1).u32(0x8000_0000);

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::Resource, 0x18, true);
        assert!(read_resources(&file, &ThrowErrorListener).is_err());

        let listener = DiagnosticsErrorListener::new();
        let root = read_resources(&file, &listener).unwrap().unwrap();
        assert_eq!(root.data_count(), 0);
        assert_eq!(listener.diagnostics().count(), 1);
    }
}
