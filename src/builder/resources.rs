//! Win32 resource directory.
//!
//! Everything is laid out in one segment, tables first:
//!
//! ```text
//! tables          breadth first, named entries before id entries
//! data entries    16 bytes each
//! names           u16 length + UTF-16 code units, 2-byte aligned
//! data            resource contents, 4-byte aligned
//! ```
//!
//! Offsets inside the tables are relative to the start of the directory. Data entries hold the
//! RVA of their contents, which is only known after layout.

use std::{cmp::Ordering, collections::HashMap};

use crate::{
    image::{
        ResourceData, ResourceDirectory, ResourceEntry, ResourceIdentifier, MAX_RESOURCE_DEPTH,
        RESOURCE_DATA_ENTRY_SIZE, RESOURCE_ENTRY_SIZE, RESOURCE_TABLE_SIZE,
    },
    io::BinaryStreamWriter,
    segment::{RelocationParameters, Segment, SegmentBuilder, SegmentOffsets},
    utils::{align_up_u32, to_u32},
    Result,
};

const SUBDIRECTORY_FLAG: u32 = 0x8000_0000;
const NAME_FLAG: u32 = 0x8000_0000;

struct TableRecord {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    named: u16,
    ids: u16,
    /// Raw `(name or id, offset)` pairs.
    entries: Vec<(u32, u32)>,
}

/// The serialized resource tree.
pub struct ResourceDirectoryBuffer {
    tables: Vec<TableRecord>,
    data: Vec<ResourceData>,
    names: Vec<String>,
    data_entries_start: u32,
    names_end: u32,
    contents_start: u32,
    contents: SegmentBuilder,
    size: u32,
    offsets: SegmentOffsets,
}

fn entry_order(a: &&ResourceEntry, b: &&ResourceEntry) -> Ordering {
    match (a.identifier(), b.identifier()) {
        (ResourceIdentifier::Name(a), ResourceIdentifier::Name(b)) => a.cmp(b),
        (ResourceIdentifier::Name(_), ResourceIdentifier::Id(_)) => Ordering::Less,
        (ResourceIdentifier::Id(_), ResourceIdentifier::Name(_)) => Ordering::Greater,
        (ResourceIdentifier::Id(a), ResourceIdentifier::Id(b)) => a.cmp(b),
    }
}

fn table_size(directory: &ResourceDirectory) -> Result<u32> {
    Ok(RESOURCE_TABLE_SIZE + RESOURCE_ENTRY_SIZE * to_u32(directory.entries.len())?)
}

enum Link {
    Table(usize),
    Data(usize),
}

impl ResourceDirectoryBuffer {
    /// Lays out the tree rooted at `root`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] for trees nested deeper than
    /// [`MAX_RESOURCE_DEPTH`] levels or tables with more than 65535 entries.
    pub fn new(root: &ResourceDirectory) -> Result<Self> {
        let mut directories: Vec<(&ResourceDirectory, usize)> = vec![(root, 0)];
        let mut leaves: Vec<&ResourceData> = Vec::new();
        let mut links: Vec<Vec<(&ResourceIdentifier, Link)>> = Vec::new();

        let mut index = 0;
        while index < directories.len() {
            let (directory, depth) = directories[index];
            if depth >= MAX_RESOURCE_DEPTH {
                return Err(crate::Error::InvalidArgument(format!(
                    "Resource tree exceeds the maximum depth of {MAX_RESOURCE_DEPTH}"
                )));
            }

            let mut entries: Vec<&ResourceEntry> = directory.entries.iter().collect();
            entries.sort_by(entry_order);

            let mut table_links = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    ResourceEntry::Directory(child) => {
                        directories.push((child, depth + 1));
                        table_links.push((entry.identifier(), Link::Table(directories.len() - 1)));
                    }
                    ResourceEntry::Data(data) => {
                        leaves.push(data);
                        table_links.push((entry.identifier(), Link::Data(leaves.len() - 1)));
                    }
                }
            }
            links.push(table_links);
            index += 1;
        }

        let mut table_offsets = Vec::with_capacity(directories.len());
        let mut cursor = 0;
        for (directory, _) in &directories {
            table_offsets.push(cursor);
            cursor += table_size(directory)?;
        }

        let data_entries_start = cursor;
        cursor += RESOURCE_DATA_ENTRY_SIZE * to_u32(leaves.len())?;

        let mut name_offsets: HashMap<&str, u32> = HashMap::new();
        let mut names = Vec::new();
        for table_links in &links {
            for (identifier, _) in table_links {
                if let ResourceIdentifier::Name(name) = identifier {
                    if !name_offsets.contains_key(name.as_str()) {
                        cursor = align_up_u32(cursor, 2);
                        name_offsets.insert(name, cursor);
                        names.push(name.clone());
                        cursor += 2 + 2 * to_u32(name.encode_utf16().count())?;
                    }
                }
            }
        }
        let names_end = cursor;
        let contents_start = align_up_u32(cursor, 4);

        let mut contents = SegmentBuilder::new();
        for leaf in &leaves {
            contents.add(leaf.contents.clone(), 4);
        }

        let mut tables = Vec::with_capacity(directories.len());
        for ((directory, _), table_links) in directories.iter().zip(&links) {
            let mut named = 0u32;
            let mut entries = Vec::with_capacity(table_links.len());
            for (identifier, link) in table_links {
                let raw_identifier = match identifier {
                    ResourceIdentifier::Name(name) => {
                        named += 1;
                        NAME_FLAG | name_offsets.get(name.as_str()).copied().unwrap_or(0)
                    }
                    ResourceIdentifier::Id(id) => *id,
                };
                let raw_offset = match link {
                    Link::Table(table) => SUBDIRECTORY_FLAG | table_offsets[*table],
                    Link::Data(leaf) => data_entries_start + RESOURCE_DATA_ENTRY_SIZE * to_u32(*leaf)?,
                };
                entries.push((raw_identifier, raw_offset));
            }

            let too_many = |_| {
                crate::Error::InvalidArgument(format!(
                    "Resource table holds {} entries",
                    table_links.len()
                ))
            };
            let ids = to_u32(table_links.len())? - named;
            tables.push(TableRecord {
                characteristics: directory.characteristics,
                time_date_stamp: directory.time_date_stamp,
                major_version: directory.major_version,
                minor_version: directory.minor_version,
                named: u16::try_from(named).map_err(too_many)?,
                ids: u16::try_from(ids).map_err(too_many)?,
                entries,
            });
        }

        let size = align_up_u32(contents_start + contents.physical_size(), 4);
        Ok(ResourceDirectoryBuffer {
            tables,
            data: leaves.into_iter().cloned().collect(),
            names,
            data_entries_start,
            names_end,
            contents_start,
            contents,
            size,
            offsets: SegmentOffsets::default(),
        })
    }
}

impl Segment for ResourceDirectoryBuffer {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
        self.contents.update_offsets(&parameters.with_offset_rva(
            parameters.offset + u64::from(self.contents_start),
            parameters.rva + self.contents_start,
        ));
    }

    fn physical_size(&self) -> u32 {
        self.size
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let start = writer.offset();
        let pad_to = |writer: &mut dyn BinaryStreamWriter, relative: u32| -> Result<()> {
            let target = start + u64::from(relative);
            let current = writer.offset();
            if target > current {
                writer.write_zeroes(target - current)?;
            }
            Ok(())
        };

        for table in &self.tables {
            writer.write_u32(table.characteristics)?;
            writer.write_u32(table.time_date_stamp)?;
            writer.write_u16(table.major_version)?;
            writer.write_u16(table.minor_version)?;
            writer.write_u16(table.named)?;
            writer.write_u16(table.ids)?;
            for (identifier, offset) in &table.entries {
                writer.write_u32(*identifier)?;
                writer.write_u32(*offset)?;
            }
        }

        pad_to(writer, self.data_entries_start)?;
        for data in &self.data {
            writer.write_u32(data.contents.rva())?;
            writer.write_u32(data.contents.physical_size())?;
            writer.write_u32(data.code_page)?;
            writer.write_u32(0)?;
        }

        for name in &self.names {
            let current = u32::try_from(writer.offset() - start).unwrap_or(0);
            pad_to(writer, align_up_u32(current, 2))?;
            writer.write_prefixed_unicode_string(name)?;
        }
        pad_to(writer, self.names_end)?;

        pad_to(writer, self.contents_start)?;
        self.contents.write(writer)?;
        pad_to(writer, self.size)
    }
}
