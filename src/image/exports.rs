//! Exported symbols.

use std::fmt;

use crate::{
    diagnostics::ErrorListener,
    io::BinaryStreamReader,
    pe::{DataDirectoryIndex, PeFile},
    segment::{AddressReference, SegmentReference},
    Result,
};

/// Size of the fixed part of the export directory.
pub const EXPORT_DIRECTORY_SIZE: u32 = 40;

const MAX_EXPORTS: u32 = 0x1_0000;

/// Where an exported symbol points.
#[derive(Clone)]
pub enum ExportAddress {
    /// A fixed RVA, as read from an existing image.
    Rva(u32),
    /// A segment placed by the builder, such as a thunk or data blob.
    Segment(SegmentReference),
    /// A forwarder string (`MODULE.Symbol`) instead of an address.
    Forwarder(String),
}

impl ExportAddress {
    /// The current RVA of the address, 0 for forwarders.
    #[must_use]
    pub fn rva(&self) -> u32 {
        match self {
            ExportAddress::Rva(rva) => *rva,
            ExportAddress::Segment(reference) => reference.rva(),
            ExportAddress::Forwarder(_) => 0,
        }
    }
}

impl fmt::Debug for ExportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportAddress::Rva(rva) => write!(f, "Rva(0x{rva:08X})"),
            ExportAddress::Segment(reference) => write!(f, "Segment({reference:?})"),
            ExportAddress::Forwarder(name) => write!(f, "Forwarder({name})"),
        }
    }
}

/// One entry of the export address table.
#[derive(Debug, Clone)]
pub struct ExportedSymbol {
    /// Exported name, `None` for a symbol that is only exported by ordinal.
    pub name: Option<String>,
    /// Target of the export.
    pub address: ExportAddress,
}

impl ExportedSymbol {
    /// Creates a named export at a fixed RVA.
    #[must_use]
    pub fn new(name: impl Into<String>, address: ExportAddress) -> Self {
        ExportedSymbol {
            name: Some(name.into()),
            address,
        }
    }

    /// Whether the export forwards to another module.
    #[must_use]
    pub fn is_forwarder(&self) -> bool {
        matches!(self.address, ExportAddress::Forwarder(_))
    }
}

/// The export directory: the exporting module's name and its address table.
///
/// The ordinal of an entry is `base_ordinal` plus its position in `entries`.
#[derive(Debug, Clone)]
pub struct ExportDirectory {
    /// Name of the exporting module.
    pub name: String,
    /// Reserved flags, usually 0.
    pub characteristics: u32,
    /// Creation time stamp.
    pub time_date_stamp: u32,
    /// User-defined major version.
    pub major_version: u16,
    /// User-defined minor version.
    pub minor_version: u16,
    /// Ordinal of the first entry.
    pub base_ordinal: u32,
    /// Export address table.
    pub entries: Vec<ExportedSymbol>,
}

impl ExportDirectory {
    /// Creates an empty directory for module `name` with ordinals starting at 1.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ExportDirectory {
            name: name.into(),
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            base_ordinal: 1,
            entries: Vec::new(),
        }
    }

    /// Ordinal of the entry at `index`.
    #[must_use]
    pub fn ordinal(&self, index: usize) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        self.base_ordinal.wrapping_add(index as u32)
    }

    /// Finds an entry by name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ExportedSymbol> {
        self.entries.iter().find(|e| e.name.as_deref() == Some(name))
    }
}

fn read_rva_table(reader: &mut BinaryStreamReader, count: u32) -> Result<Vec<u32>> {
    (0..count).map(|_| reader.read_u32()).collect()
}

/// Reads the export directory of `file`.
///
/// # Errors
/// Returns [`crate::Error::EndOfStream`] for truncated tables, or whatever `listener`
/// escalates for unmapped names.
pub fn read_exports(file: &PeFile, listener: &dyn ErrorListener) -> Result<Option<ExportDirectory>> {
    let directory = file.data_directory(DataDirectoryIndex::Export);
    if !directory.is_present() {
        return Ok(None);
    }

    let mut reader = match file.create_reader_at_rva(directory.virtual_address) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Export directory is not mapped: {error}"))?;
            return Ok(None);
        }
    };

    let characteristics = reader.read_u32()?;
    let time_date_stamp = reader.read_u32()?;
    let major_version = reader.read_u16()?;
    let minor_version = reader.read_u16()?;
    let name_rva = reader.read_u32()?;
    let base_ordinal = reader.read_u32()?;
    let number_of_functions = reader.read_u32()?;
    let number_of_names = reader.read_u32()?;
    let address_of_functions = reader.read_u32()?;
    let address_of_names = reader.read_u32()?;
    let address_of_name_ordinals = reader.read_u32()?;

    if number_of_functions > MAX_EXPORTS || number_of_names > number_of_functions {
        listener.bad_image(&format!(
            "Invalid export counts: {number_of_functions} functions, {number_of_names} names"
        ))?;
        return Ok(None);
    }

    let name = file.create_reader_at_rva(name_rva)?.read_ascii_string();

    let functions = read_rva_table(&mut file.create_reader_at_rva(address_of_functions)?, number_of_functions)?;
    let is_forwarder = |rva: u32| {
        rva >= directory.virtual_address && rva - directory.virtual_address < directory.size
    };

    let mut entries = Vec::with_capacity(functions.len());
    for rva in functions {
        let address = if is_forwarder(rva) {
            ExportAddress::Forwarder(file.create_reader_at_rva(rva)?.read_ascii_string())
        } else {
            ExportAddress::Rva(rva)
        };
        entries.push(ExportedSymbol {
            name: None,
            address,
        });
    }

    if number_of_names > 0 {
        let names = read_rva_table(&mut file.create_reader_at_rva(address_of_names)?, number_of_names)?;
        let mut ordinals = file.create_reader_at_rva(address_of_name_ordinals)?;
        for name_rva in names {
            let index = usize::from(ordinals.read_u16()?);
            let Some(entry) = entries.get_mut(index) else {
                listener.bad_image(&format!("Export name ordinal {index} is out of range"))?;
                continue;
            };
            match file.create_reader_at_rva(name_rva) {
                Ok(mut name) => entry.name = Some(name.read_ascii_string()),
                Err(error) => listener.bad_image(&format!("Invalid export name RVA: {error}"))?,
            }
        }
    }

    tracing::debug!(module = %name, entries = entries.len(), "read export directory");
    Ok(Some(ExportDirectory {
        name,
        characteristics,
        time_date_stamp,
        major_version,
        minor_version,
        base_ordinal,
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::ThrowErrorListener,
        test::factories::image::{file_with_directory, ImageBytes},
    };

    #[test]
    fn names_ordinals_and_forwarders() {
        let mut bytes = ImageBytes::new(0x2000);
        // Directory: name, base 5, 2 functions, 1 name.
        bytes
            .u32(0)
            .u32(0x1234)
            .u16(1)
            .u16(2)
            .u32(0x2080)
            .u32(5)
            .u32(2)
            .u32(1)
            .u32(0x2040)
            .u32(0x2050)
            .u32(0x2060);
        bytes.seek(0x40).u32(0x3000).u32(0x2030);
        bytes.seek(0x30).ascii("NTDLL.RtlExit");
        bytes.seek(0x50).u32(0x2090);
        bytes.seek(0x60).u16(1);
        bytes.seek(0x80).ascii("sample.dll");
        bytes.seek(0x90).ascii("Exit");

        let file = file_with_directory(bytes.into_inner(), DataDirectoryIndex::Export, 0x40, true);
        let exports = read_exports(&file, &ThrowErrorListener).unwrap().unwrap();

        assert_eq!(exports.name, "sample.dll");
        assert_eq!(exports.time_date_stamp, 0x1234);
        assert_eq!(exports.entries.len(), 2);
        assert_eq!(exports.ordinal(1), 6);

        assert!(exports.entries[0].name.is_none());
        assert_eq!(exports.entries[0].address.rva(), 0x3000);
        assert_eq!(exports.entries[1].name.as_deref(), Some("Exit"));
        assert!(matches!(
            &exports.entries[1].address,
            ExportAddress::Forwarder(target) if target == "NTDLL.RtlExit"
        ));
    }
}
