//! CLR 2.0 (COR20) header.
//!
//! The header is the entry point of the .NET data directory
//! (`IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR`). It points at the metadata, managed resources,
//! strong name signature, VTable fixups and a few rarely used native structures.
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use bitflags::bitflags;

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter},
    pe::DataDirectory,
    Result,
};

bitflags! {
    /// Runtime flags of a .NET image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DotNetDirectoryFlags: u32 {
        /// The image only contains IL code.
        const IL_ONLY = 0x0000_0001;
        /// The image can only be loaded into a 32-bit process.
        const REQUIRES_32BIT = 0x0000_0002;
        /// The image is a library of IL code.
        const IL_LIBRARY = 0x0000_0004;
        /// The image is signed with a strong name.
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// The entry point field holds an RVA to native code instead of a token.
        const NATIVE_ENTRY_POINT = 0x0000_0010;
        /// The loader and JIT track debug information.
        const TRACK_DEBUG_DATA = 0x0001_0000;
        /// The image prefers to be loaded into a 32-bit process.
        const PREFERS_32BIT = 0x0002_0000;
    }
}

impl DotNetDirectoryFlags {
    /// Whether an image with these flags runs as a 32-bit process on a platform whose native
    /// word size is given by `platform_is_32bit`.
    #[must_use]
    pub fn is_loaded_as_32bit(self, platform_is_32bit: bool) -> bool {
        platform_is_32bit
            || self.contains(Self::REQUIRES_32BIT)
            || (self.contains(Self::PREFERS_32BIT) && self.contains(Self::IL_ONLY))
    }
}

/// Raw COR20 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cor20Header {
    /// Size of the header, always 72.
    pub cb: u32,
    /// Minimum runtime major version.
    pub major_runtime_version: u16,
    /// Minimum runtime minor version.
    pub minor_runtime_version: u16,
    /// Metadata directory (root, streams).
    pub metadata: DataDirectory,
    /// Runtime flags.
    pub flags: DotNetDirectoryFlags,
    /// Metadata token of the managed entry point, or an RVA if
    /// [`DotNetDirectoryFlags::NATIVE_ENTRY_POINT`] is set.
    pub entry_point: u32,
    /// Managed resources blob.
    pub resources: DataDirectory,
    /// Strong name signature hash.
    pub strong_name_signature: DataDirectory,
    /// Code manager table, unused by current runtimes.
    pub code_manager_table: DataDirectory,
    /// VTable fixup table for unmanaged exports.
    pub vtable_fixups: DataDirectory,
    /// Export address table jumps, unused by current runtimes.
    pub export_address_table_jumps: DataDirectory,
    /// ReadyToRun / NGEN native header.
    pub managed_native_header: DataDirectory,
}

impl Cor20Header {
    /// Serialized size of the header.
    pub const SIZE: u32 = 72;

    /// Reads the header at the current position of `reader`.
    ///
    /// Undefined flag bits are preserved. Only the size field is checked, since runtimes accept
    /// headers with values outside of what ECMA-335 describes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `cb` is smaller than 72, or
    /// [`crate::Error::EndOfStream`] if the reader is too short.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let cb = reader.read_u32()?;
        if cb < Self::SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected at least {}, got {}",
                Self::SIZE,
                cb
            ));
        }

        let major_runtime_version = reader.read_u16()?;
        let minor_runtime_version = reader.read_u16()?;
        let metadata = read_directory(reader)?;
        let flags = DotNetDirectoryFlags::from_bits_retain(reader.read_u32()?);
        let entry_point = reader.read_u32()?;

        Ok(Cor20Header {
            cb,
            major_runtime_version,
            minor_runtime_version,
            metadata,
            flags,
            entry_point,
            resources: read_directory(reader)?,
            strong_name_signature: read_directory(reader)?,
            code_manager_table: read_directory(reader)?,
            vtable_fixups: read_directory(reader)?,
            export_address_table_jumps: read_directory(reader)?,
            managed_native_header: read_directory(reader)?,
        })
    }

    /// Writes the 72-byte header.
    ///
    /// # Errors
    /// Returns an error if the writer fails.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_u32(Self::SIZE)?;
        writer.write_u16(self.major_runtime_version)?;
        writer.write_u16(self.minor_runtime_version)?;
        write_directory(writer, self.metadata)?;
        writer.write_u32(self.flags.bits())?;
        writer.write_u32(self.entry_point)?;
        for directory in [
            self.resources,
            self.strong_name_signature,
            self.code_manager_table,
            self.vtable_fixups,
            self.export_address_table_jumps,
            self.managed_native_header,
        ] {
            write_directory(writer, directory)?;
        }
        Ok(())
    }
}

fn read_directory(reader: &mut BinaryStreamReader) -> Result<DataDirectory> {
    Ok(DataDirectory {
        virtual_address: reader.read_u32()?,
        size: reader.read_u32()?,
    })
}

fn write_directory(writer: &mut dyn BinaryStreamWriter, directory: DataDirectory) -> Result<()> {
    writer.write_u32(directory.virtual_address)?;
    writer.write_u32(directory.size)
}
