//! Export directory.
//!
//! ```text
//! +0   directory header (40 bytes)
//! +40  export address table (u32 per entry)
//!      name pointer table (u32 per named entry, sorted by name)
//!      ordinal table (u16 per named entry, parallel to the name pointers)
//!      module name, symbol names, forwarder strings (ASCII, NUL terminated)
//! ```

use std::collections::HashMap;

use crate::{
    image::{ExportAddress, ExportDirectory, EXPORT_DIRECTORY_SIZE},
    io::BinaryStreamWriter,
    segment::{RelocationParameters, Segment, SegmentOffsets},
    utils::{align_up_u32, to_u32},
    Result,
};

/// The serialized export directory. Entry addresses are resolved when written.
pub struct ExportDirectoryBuffer {
    directory: ExportDirectory,
    /// `(name, entry index)` sorted by name.
    names: Vec<(String, u16)>,
    address_table: u32,
    name_pointers: u32,
    ordinals: u32,
    module_name: u32,
    name_offsets: Vec<u32>,
    forwarders: HashMap<usize, u32>,
    content_size: u32,
    size: u32,
    offsets: SegmentOffsets,
}

impl ExportDirectoryBuffer {
    /// Lays out `directory`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if there are more than 65535 entries.
    pub fn new(directory: &ExportDirectory) -> Result<Self> {
        let mut names = Vec::new();
        for (index, entry) in directory.entries.iter().enumerate() {
            if let Some(name) = &entry.name {
                let index = u16::try_from(index).map_err(|_| {
                    crate::Error::InvalidArgument(format!(
                        "Export table holds {} entries",
                        directory.entries.len()
                    ))
                })?;
                names.push((name.clone(), index));
            }
        }
        names.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let address_table = EXPORT_DIRECTORY_SIZE;
        let name_pointers = address_table + 4 * to_u32(directory.entries.len())?;
        let ordinals = name_pointers + 4 * to_u32(names.len())?;
        let module_name = ordinals + 2 * to_u32(names.len())?;

        let mut cursor = module_name + to_u32(directory.name.len())? + 1;
        let mut name_offsets = Vec::with_capacity(names.len());
        for (name, _) in &names {
            name_offsets.push(cursor);
            cursor += to_u32(name.len())? + 1;
        }

        let mut forwarders = HashMap::new();
        for (index, entry) in directory.entries.iter().enumerate() {
            if let ExportAddress::Forwarder(target) = &entry.address {
                forwarders.insert(index, cursor);
                cursor += to_u32(target.len())? + 1;
            }
        }

        Ok(ExportDirectoryBuffer {
            directory: directory.clone(),
            names,
            address_table,
            name_pointers,
            ordinals,
            module_name,
            name_offsets,
            forwarders,
            content_size: cursor,
            size: align_up_u32(cursor, 4),
            offsets: SegmentOffsets::default(),
        })
    }
}

impl Segment for ExportDirectoryBuffer {
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
        let base = self.rva();
        let directory = &self.directory;
        let entry_count = to_u32(directory.entries.len())?;
        let name_count = to_u32(self.names.len())?;

        writer.write_u32(directory.characteristics)?;
        writer.write_u32(directory.time_date_stamp)?;
        writer.write_u16(directory.major_version)?;
        writer.write_u16(directory.minor_version)?;
        writer.write_u32(base + self.module_name)?;
        writer.write_u32(directory.base_ordinal)?;
        writer.write_u32(entry_count)?;
        writer.write_u32(name_count)?;
        writer.write_u32(base + self.address_table)?;
        writer.write_u32(if name_count > 0 { base + self.name_pointers } else { 0 })?;
        writer.write_u32(if name_count > 0 { base + self.ordinals } else { 0 })?;

        for (index, entry) in directory.entries.iter().enumerate() {
            let rva = match self.forwarders.get(&index) {
                Some(offset) => base + offset,
                None => entry.address.rva(),
            };
            writer.write_u32(rva)?;
        }
        for offset in &self.name_offsets {
            writer.write_u32(base + offset)?;
        }
        for (_, index) in &self.names {
            writer.write_u16(*index)?;
        }

        writer.write_ascii_string(&directory.name)?;
        for (name, _) in &self.names {
            writer.write_ascii_string(name)?;
        }
        for entry in &directory.entries {
            if let ExportAddress::Forwarder(target) = &entry.address {
                writer.write_ascii_string(target)?;
            }
        }

        writer.write_zeroes(u64::from(self.size - self.content_size))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        image::ExportedSymbol,
        segment::{DataSegment, SegmentRef, SegmentReference},
    };

    fn u32_at(bytes: &[u8], at: u32) -> u32 {
        let at = at as usize;
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn c_string(bytes: &[u8], at: u32) -> &str {
        let at = at as usize;
        let end = bytes[at..].iter().position(|b| *b == 0).unwrap() + at;
        std::str::from_utf8(&bytes[at..end]).unwrap()
    }

    #[test]
    fn names_are_sorted_and_ordinals_follow() {
        let target: SegmentRef = Arc::new(DataSegment::with_location(vec![0xC3], 0x600, 0x5000));
        let mut directory = ExportDirectory::new("Library.dll");
        directory.entries.push(ExportedSymbol::new("Zeta", ExportAddress::Rva(0x1010)));
        directory.entries.push(ExportedSymbol::new(
            "Alpha",
            ExportAddress::Segment(SegmentReference::new(target)),
        ));
        directory.entries.push(ExportedSymbol::new(
            "Forward",
            ExportAddress::Forwarder("NTDLL.RtlAlloc".into()),
        ));

        let buffer = ExportDirectoryBuffer::new(&directory).unwrap();
        buffer.update_offsets(&RelocationParameters::new(0x800, 0x4000));
        let bytes = buffer.to_bytes().unwrap();
        assert_eq!(bytes.len() as u32, buffer.physical_size());
        assert_eq!(bytes.len() % 4, 0);

        let rel = |rva: u32| rva - 0x4000;
        assert_eq!(c_string(&bytes, rel(u32_at(&bytes, 12))), "Library.dll");
        assert_eq!(u32_at(&bytes, 16), 1);
        assert_eq!(u32_at(&bytes, 20), 3);
        assert_eq!(u32_at(&bytes, 24), 3);

        let functions = rel(u32_at(&bytes, 28));
        assert_eq!(u32_at(&bytes, functions), 0x1010);
        assert_eq!(u32_at(&bytes, functions + 4), 0x5000);
        let forwarder = rel(u32_at(&bytes, functions + 8));
        assert_eq!(c_string(&bytes, forwarder), "NTDLL.RtlAlloc");

        let names = rel(u32_at(&bytes, 32));
        let ordinals = rel(u32_at(&bytes, 36)) as usize;
        let sorted: Vec<&str> = (0..3)
            .map(|i| c_string(&bytes, rel(u32_at(&bytes, names + 4 * i))))
            .collect();
        assert_eq!(sorted, ["Alpha", "Forward", "Zeta"]);
        let indices: Vec<u16> = (0..3)
            .map(|i| u16::from_le_bytes([bytes[ordinals + 2 * i], bytes[ordinals + 2 * i + 1]]))
            .collect();
        assert_eq!(indices, [1, 2, 0]);
    }

    #[test]
    fn ordinal_only_exports_have_no_name_tables() {
        let mut directory = ExportDirectory::new("a.dll");
        directory.entries.push(ExportedSymbol {
            name: None,
            address: ExportAddress::Rva(0x1000),
        });
        let buffer = ExportDirectoryBuffer::new(&directory).unwrap();
        let bytes = buffer.to_bytes().unwrap();
        assert_eq!(u32_at(&bytes, 24), 0);
        assert_eq!(u32_at(&bytes, 32), 0);
        assert_eq!(u32_at(&bytes, 36), 0);
    }
}
