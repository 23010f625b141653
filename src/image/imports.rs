//! Imported modules and symbols.
//!
//! The import directory is a table of 20-byte descriptors terminated by an all-zero entry:
//!
//! ```text
//! +0  OriginalFirstThunk  RVA of the import lookup table
//! +4  TimeDateStamp
//! +8  ForwarderChain
//! +12 Name                RVA of the module name
//! +16 FirstThunk          RVA of the import address table
//! ```
//!
//! Each lookup table entry is a native-sized integer. The highest bit marks an import by
//! ordinal; otherwise the entry holds the RVA of a hint/name pair.

use std::fmt;

use crate::{
    diagnostics::{ErrorListener, ThrowErrorListener},
    pe::{DataDirectoryIndex, PeFile},
    utils::to_u32,
    Result,
};

/// Size of one import descriptor.
pub const IMPORT_DESCRIPTOR_SIZE: u32 = 20;

/// Stops reading modules or thunks that do not terminate.
const MAX_IMPORT_ENTRIES: usize = 0x1_0000;

/// A symbol imported from a module, either by name or by ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedSymbol {
    /// Name of the symbol, or `None` for an import by ordinal.
    pub name: Option<String>,
    /// Index into the export name table of the module, used as a lookup hint.
    pub hint: u16,
    /// Ordinal of the symbol; only meaningful when `name` is `None`.
    pub ordinal: u16,
}

impl ImportedSymbol {
    /// Creates an import by name.
    #[must_use]
    pub fn by_name(hint: u16, name: impl Into<String>) -> Self {
        ImportedSymbol {
            name: Some(name.into()),
            hint,
            ordinal: 0,
        }
    }

    /// Creates an import by ordinal.
    #[must_use]
    pub fn by_ordinal(ordinal: u16) -> Self {
        ImportedSymbol {
            name: None,
            hint: 0,
            ordinal,
        }
    }

    /// Whether the symbol is imported by ordinal.
    #[must_use]
    pub fn is_by_ordinal(&self) -> bool {
        self.name.is_none()
    }
}

impl fmt::Display for ImportedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "#{}", self.ordinal),
        }
    }
}

/// A module referenced by the import directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportedModule {
    /// File name of the module, e.g. `mscoree.dll`.
    pub name: String,
    /// Time stamp of the bound module, usually 0.
    pub time_date_stamp: u32,
    /// Index of the first forwarder reference.
    pub forwarder_chain: u32,
    /// Imported symbols in table order.
    pub symbols: Vec<ImportedSymbol>,
}

impl ImportedModule {
    /// Creates a module without symbols.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ImportedModule {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Finds a symbol by name.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&ImportedSymbol> {
        self.symbols.iter().find(|s| s.name.as_deref() == Some(name))
    }

    /// Position of a symbol by name.
    #[must_use]
    pub fn symbol_index(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s.name.as_deref() == Some(name))
    }
}

impl fmt::Display for ImportedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} symbols)", self.name, self.symbols.len())
    }
}

/// Reads the import directory of `file`.
///
/// Descriptors whose name or lookup table cannot be read are reported to `listener` and
/// skipped.
///
/// # Errors
/// Returns whatever `listener` escalates.
pub fn read_imports(file: &PeFile, listener: &dyn ErrorListener) -> Result<Vec<ImportedModule>> {
    let directory = file.data_directory(DataDirectoryIndex::Import);
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let mut reader = match file.create_reader_at_rva(directory.virtual_address) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Import directory is not mapped: {error}"))?;
            return Ok(Vec::new());
        }
    };

    let mut modules = Vec::new();
    while modules.len() < MAX_IMPORT_ENTRIES {
        if !reader.can_read(IMPORT_DESCRIPTOR_SIZE) {
            listener.bad_image("Import directory is not terminated")?;
            break;
        }

        let original_first_thunk = reader.read_u32()?;
        let time_date_stamp = reader.read_u32()?;
        let forwarder_chain = reader.read_u32()?;
        let name_rva = reader.read_u32()?;
        let first_thunk = reader.read_u32()?;

        if original_first_thunk == 0
            && time_date_stamp == 0
            && forwarder_chain == 0
            && name_rva == 0
            && first_thunk == 0
        {
            break;
        }

        let name = match file.create_reader_at_rva(name_rva) {
            Ok(mut name_reader) => name_reader.read_ascii_string(),
            Err(error) => {
                listener.bad_image(&format!("Invalid import module name RVA 0x{name_rva:08X}: {error}"))?;
                continue;
            }
        };

        let lookup_rva = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };
        let symbols = read_thunks(file, lookup_rva, &name, listener)?;

        modules.push(ImportedModule {
            name,
            time_date_stamp,
            forwarder_chain,
            symbols,
        });
    }

    tracing::debug!(modules = modules.len(), "read import directory");
    Ok(modules)
}

/// Finds the RVA of the address table slot that `module!symbol` is bound to.
///
/// The module name is compared case-insensitively.
///
/// # Errors
/// Returns an error if the import directory or a lookup table is not mapped.
pub fn find_import_address(file: &PeFile, module: &str, symbol: &str) -> Result<Option<u32>> {
    let directory = file.data_directory(DataDirectoryIndex::Import);
    if !directory.is_present() {
        return Ok(None);
    }

    let is_32bit = file.is_32bit();
    let pointer_size = if is_32bit { 4 } else { 8 };
    let mut reader = file.create_reader_at_rva(directory.virtual_address)?;
    for _ in 0..MAX_IMPORT_ENTRIES {
        if !reader.can_read(IMPORT_DESCRIPTOR_SIZE) {
            break;
        }
        let original_first_thunk = reader.read_u32()?;
        reader.skip(8)?;
        let name_rva = reader.read_u32()?;
        let first_thunk = reader.read_u32()?;
        if name_rva == 0 && first_thunk == 0 {
            break;
        }

        let name = file.create_reader_at_rva(name_rva)?.read_ascii_string();
        if !name.eq_ignore_ascii_case(module) {
            continue;
        }

        let lookup_rva = if original_first_thunk != 0 {
            original_first_thunk
        } else {
            first_thunk
        };
        let index = read_thunks(file, lookup_rva, &name, &ThrowErrorListener)?
            .iter()
            .position(|s| s.name.as_deref() == Some(symbol));
        if let Some(index) = index {
            return Ok(Some(first_thunk + to_u32(index)? * pointer_size));
        }
    }

    Ok(None)
}

fn read_thunks(
    file: &PeFile,
    rva: u32,
    module: &str,
    listener: &dyn ErrorListener,
) -> Result<Vec<ImportedSymbol>> {
    let is_32bit = file.is_32bit();
    let ordinal_flag = if is_32bit { 1u64 << 31 } else { 1u64 << 63 };

    let mut reader = match file.create_reader_at_rva(rva) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("Invalid lookup table of {module}: {error}"))?;
            return Ok(Vec::new());
        }
    };

    let mut symbols = Vec::new();
    while symbols.len() < MAX_IMPORT_ENTRIES {
        let Ok(entry) = reader.read_native_int(is_32bit) else {
            listener.bad_image(&format!("Lookup table of {module} is not terminated"))?;
            break;
        };
        if entry == 0 {
            break;
        }

        if entry & ordinal_flag != 0 {
            #[allow(clippy::cast_possible_truncation)]
            symbols.push(ImportedSymbol::by_ordinal(entry as u16));
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let hint_name_rva = (entry & 0x7FFF_FFFF) as u32;
        match file.create_reader_at_rva(hint_name_rva) {
            Ok(mut hint_name) => {
                let hint = hint_name.read_u16()?;
                symbols.push(ImportedSymbol::by_name(hint, hint_name.read_ascii_string()));
            }
            Err(error) => {
                listener.bad_image(&format!(
                    "Invalid hint/name RVA 0x{hint_name_rva:08X} in {module}: {error}"
                ))?;
            }
        }
    }

    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::{DiagnosticsErrorListener, ThrowErrorListener},
        test::factories::image::{file_with_directory, ImageBytes},
    };

    /// One module with a named import and an ordinal import, at RVA 0x2000.
    fn import_section(is_32bit: bool) -> Vec<u8> {
        let mut bytes = ImageBytes::new(0x2000);
        let lookup = 0x2000 + 0x40;
        let name = 0x2000 + 0x80;
        let hint_name = 0x2000 + 0x90;

        bytes.u32(lookup).u32(0).u32(0).u32(name).u32(lookup);
        bytes.zeroes(20);
        bytes.seek(0x40);
        if is_32bit {
            bytes.u32(hint_name).u32(0x8000_0007).u32(0);
        } else {
            bytes
                .u64(u64::from(hint_name))
                .u64(0x8000_0000_0000_0007)
                .u64(0);
        }
        bytes.seek(0x80).ascii("KERNEL32.dll");
        bytes.seek(0x90).u16(0x12).ascii("ExitProcess");
        bytes.into_inner()
    }

    #[test]
    fn named_and_ordinal_imports() {
        for is_32bit in [true, false] {
            let file = file_with_directory(
                import_section(is_32bit),
                DataDirectoryIndex::Import,
                40,
                is_32bit,
            );
            let modules = read_imports(&file, &ThrowErrorListener).unwrap();

            assert_eq!(modules.len(), 1);
            assert_eq!(modules[0].name, "KERNEL32.dll");
            assert_eq!(
                modules[0].symbols,
                vec![
                    ImportedSymbol::by_name(0x12, "ExitProcess"),
                    ImportedSymbol::by_ordinal(7)
                ]
            );
            assert_eq!(modules[0].symbol_index("ExitProcess"), Some(0));
        }
    }

    #[test]
    fn unmapped_name_is_reported() {
        let mut section = import_section(true);
        // Name RVA far outside the image.
        section[12..16].copy_from_slice(&0x0090_0000u32.to_le_bytes());
        let file = file_with_directory(section, DataDirectoryIndex::Import, 40, true);

        assert!(read_imports(&file, &ThrowErrorListener).is_err());

        let listener = DiagnosticsErrorListener::new();
        assert!(read_imports(&file, &listener).unwrap().is_empty());
        assert_eq!(listener.diagnostics().count(), 1);
    }

    #[test]
    fn import_address_slots() {
        for is_32bit in [true, false] {
            let file = file_with_directory(
                import_section(is_32bit),
                DataDirectoryIndex::Import,
                40,
                is_32bit,
            );
            assert_eq!(
                find_import_address(&file, "kernel32.DLL", "ExitProcess").unwrap(),
                Some(0x2040)
            );
            assert_eq!(find_import_address(&file, "KERNEL32.dll", "Sleep").unwrap(), None);
            assert_eq!(find_import_address(&file, "user32.dll", "ExitProcess").unwrap(), None);
        }
    }

    #[test]
    fn missing_directory() {
        let file = crate::test::factories::pe::build_sample_file();
        assert!(read_imports(&file, &ThrowErrorListener).unwrap().is_empty());
    }
}
