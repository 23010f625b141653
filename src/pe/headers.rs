//! DOS, COFF and optional headers.

use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter},
    Error, Result,
};

/// `MZ`
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// `PE\0\0`
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// Offset of `e_lfanew` inside the DOS header.
pub const NEXT_HEADER_FIELD_OFFSET: usize = 0x3C;

/// Size of the COFF file header.
pub const FILE_HEADER_SIZE: u32 = 20;

/// Number of data directories emitted by the builders.
pub const DEFAULT_NUMBER_OF_RVA_AND_SIZES: usize = 16;

/// Offset of the `CheckSum` field relative to the start of the optional header.
pub const CHECKSUM_FIELD_OFFSET: u64 = 64;

/// The stub every linker emits: a 64-byte DOS header followed by a program printing
/// "This program cannot be run in DOS mode."
const DEFAULT_DOS_STUB: [u8; 0x80] = [
    0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00,
    0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00,
    0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21, 0x54, 0x68,
    0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D, 0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F,
    0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20,
    0x6D, 0x6F, 0x64, 0x65, 0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The MS-DOS header, including the stub program and anything else before the NT headers
/// (such as a Rich header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosHeader {
    raw: Vec<u8>,
    /// Offset of the `PE\0\0` signature (`e_lfanew`).
    pub next_header_offset: u32,
}

impl Default for DosHeader {
    fn default() -> Self {
        DosHeader {
            raw: DEFAULT_DOS_STUB.to_vec(),
            next_header_offset: 0x80,
        }
    }
}

impl DosHeader {
    /// Reads the DOS header and stub, leaving the reader at the start of the NT headers.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the `MZ` signature is missing or `e_lfanew` points
    /// inside the DOS header.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let start = reader.offset();
        let magic = reader.read_u16()?;
        if magic != DOS_SIGNATURE {
            return Err(malformed_error!("Invalid DOS signature - 0x{:04X}", magic));
        }

        reader.set_offset(start + NEXT_HEADER_FIELD_OFFSET as u64)?;
        let next_header_offset = reader.read_u32()?;
        if (next_header_offset as usize) < NEXT_HEADER_FIELD_OFFSET + 4 {
            return Err(malformed_error!(
                "NT headers offset 0x{:X} overlaps the DOS header",
                next_header_offset
            ));
        }

        reader.set_offset(start)?;
        let raw = reader.read_exact(next_header_offset)?;

        Ok(DosHeader {
            raw,
            next_header_offset,
        })
    }

    /// The stub bytes as they will be written (without the `e_lfanew` patch).
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Writes the header and stub, patching `e_lfanew`. The stub is truncated or zero-padded
    /// to end exactly at [`DosHeader::next_header_offset`].
    ///
    /// # Errors
    /// Returns an error if the writer rejects the data.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let mut raw = self.raw.clone();
        raw.resize(self.next_header_offset as usize, 0);
        if raw.len() >= NEXT_HEADER_FIELD_OFFSET + 4 {
            raw[NEXT_HEADER_FIELD_OFFSET..NEXT_HEADER_FIELD_OFFSET + 4]
                .copy_from_slice(&self.next_header_offset.to_le_bytes());
        }
        writer.write_bytes(&raw)
    }
}

const DOTNET_APPLE: u16 = 0x4644;
const DOTNET_FREEBSD: u16 = 0xADC4;
const DOTNET_LINUX: u16 = 0x7B79;
const DOTNET_NETBSD: u16 = 0x1993;
const DOTNET_SUN: u16 = 0x1992;

/// Target architecture of an image.
///
/// ReadyToRun images for non-Windows hosts XOR the machine value with an OS-specific
/// constant; those combinations are listed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum MachineType {
    Unknown = 0x0000,
    Am33 = 0x01D3,
    Amd64 = 0x8664,
    Amd64DotNetApple = 0x8664 ^ DOTNET_APPLE,
    Amd64DotNetFreeBsd = 0x8664 ^ DOTNET_FREEBSD,
    Amd64DotNetLinux = 0x8664 ^ DOTNET_LINUX,
    Amd64DotNetNetBsd = 0x8664 ^ DOTNET_NETBSD,
    Amd64DotNetSun = 0x8664 ^ DOTNET_SUN,
    Arm = 0x01C0,
    ArmNt = 0x01C4,
    ArmNtDotNetApple = 0x01C4 ^ DOTNET_APPLE,
    ArmNtDotNetFreeBsd = 0x01C4 ^ DOTNET_FREEBSD,
    ArmNtDotNetLinux = 0x01C4 ^ DOTNET_LINUX,
    ArmNtDotNetNetBsd = 0x01C4 ^ DOTNET_NETBSD,
    ArmNtDotNetSun = 0x01C4 ^ DOTNET_SUN,
    Arm64 = 0xAA64,
    Arm64DotNetApple = 0xAA64 ^ DOTNET_APPLE,
    Arm64DotNetFreeBsd = 0xAA64 ^ DOTNET_FREEBSD,
    Arm64DotNetLinux = 0xAA64 ^ DOTNET_LINUX,
    Arm64DotNetNetBsd = 0xAA64 ^ DOTNET_NETBSD,
    Arm64DotNetSun = 0xAA64 ^ DOTNET_SUN,
    Ebc = 0x0EBC,
    I386 = 0x014C,
    I386DotNetApple = 0x014C ^ DOTNET_APPLE,
    I386DotNetFreeBsd = 0x014C ^ DOTNET_FREEBSD,
    I386DotNetLinux = 0x014C ^ DOTNET_LINUX,
    I386DotNetNetBsd = 0x014C ^ DOTNET_NETBSD,
    I386DotNetSun = 0x014C ^ DOTNET_SUN,
    Ia64 = 0x0200,
    M32R = 0x9041,
    Mips16 = 0x0266,
    MipsFpu = 0x0366,
    MipsFpu16 = 0x0466,
    PowerPc = 0x01F0,
    PowerPcFp = 0x01F1,
    R4000 = 0x0166,
    Sh3 = 0x01A2,
    Sh3Dsp = 0x01A3,
    Sh4 = 0x01A6,
    Sh5 = 0x01A8,
    Thumb = 0x01C2,
    WceMipsV2 = 0x0169,
    RiscV32 = 0x5032,
    RiscV64 = 0x5064,
    RiscV128 = 0x5128,
}

impl MachineType {
    /// The machine with any .NET OS override removed.
    #[must_use]
    pub fn base_machine(self) -> MachineType {
        let raw = self as u16;
        for overlay in [DOTNET_APPLE, DOTNET_FREEBSD, DOTNET_LINUX, DOTNET_NETBSD, DOTNET_SUN] {
            if let Some(machine @ (MachineType::I386
            | MachineType::Amd64
            | MachineType::ArmNt
            | MachineType::Arm64)) = MachineType::from_repr(raw ^ overlay)
            {
                return machine;
            }
        }
        self
    }
}

bitflags! {
    /// COFF file header characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Characteristics: u16 {
        /// Image has no base relocations
        const RELOCS_STRIPPED = 0x0001;
        /// Image is valid and can be run
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers removed
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF local symbols removed
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Aggressively trim working set
        const AGGRESSIVE_WS_TRIM = 0x0010;
        /// Application can handle > 2 GB addresses
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Little endian (deprecated)
        const BYTES_REVERSED_LO = 0x0080;
        /// Machine is based on a 32-bit-word architecture
        const MACHINE_32BIT = 0x0100;
        /// Debugging information removed
        const DEBUG_STRIPPED = 0x0200;
        /// Copy to swap file when run from removable media
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// Copy to swap file when run from network media
        const NET_RUN_FROM_SWAP = 0x0800;
        /// System file
        const SYSTEM = 0x1000;
        /// The image is a DLL
        const DLL = 0x2000;
        /// Uniprocessor machine only
        const UP_SYSTEM_ONLY = 0x4000;
        /// Big endian (deprecated)
        const BYTES_REVERSED_HI = 0x8000;
    }
}

bitflags! {
    /// Optional header DLL characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DllCharacteristics: u16 {
        /// Image can handle a high entropy 64-bit virtual address space
        const HIGH_ENTROPY_VA = 0x0020;
        /// DLL can be relocated at load time
        const DYNAMIC_BASE = 0x0040;
        /// Code integrity checks are enforced
        const FORCE_INTEGRITY = 0x0080;
        /// Image is NX compatible
        const NX_COMPAT = 0x0100;
        /// Isolation aware, but do not isolate the image
        const NO_ISOLATION = 0x0200;
        /// Does not use structured exception handling
        const NO_SEH = 0x0400;
        /// Do not bind the image
        const NO_BIND = 0x0800;
        /// Image must execute in an AppContainer
        const APP_CONTAINER = 0x1000;
        /// A WDM driver
        const WDM_DRIVER = 0x2000;
        /// Image supports Control Flow Guard
        const CONTROL_FLOW_GUARD = 0x4000;
        /// Terminal Server aware
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

/// Windows subsystem required to run the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum SubSystem {
    Unknown = 0,
    Native = 1,
    WindowsGui = 2,
    WindowsCui = 3,
    Os2Cui = 5,
    PosixCui = 7,
    NativeWindows = 8,
    WindowsCeGui = 9,
    EfiApplication = 10,
    EfiBootServiceDriver = 11,
    EfiRuntimeDriver = 12,
    EfiRom = 13,
    Xbox = 14,
    WindowsBootApplication = 16,
}

/// Index of a well-known entry in the data directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumCount, FromRepr)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum DataDirectoryIndex {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Certificate = 4,
    BaseRelocation = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    Clr = 14,
    Reserved = 15,
}

/// An `(RVA, size)` pair in the data directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DataDirectory {
    /// RVA of the structure (a file offset for the certificate table).
    pub virtual_address: u32,
    /// Size of the structure.
    pub size: u32,
}

impl DataDirectory {
    /// Creates a directory entry.
    #[must_use]
    pub const fn new(virtual_address: u32, size: u32) -> Self {
        DataDirectory {
            virtual_address,
            size,
        }
    }

    /// Whether the entry references anything.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0
    }
}

/// The COFF file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Target architecture
    pub machine: MachineType,
    /// Number of entries in the section table
    pub number_of_sections: u16,
    /// Link time, seconds since the Unix epoch
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table
    pub pointer_to_symbol_table: u32,
    /// Number of COFF symbols
    pub number_of_symbols: u32,
    /// Size of the optional header
    pub size_of_optional_header: u16,
    /// Image attributes
    pub characteristics: Characteristics,
}

impl Default for FileHeader {
    fn default() -> Self {
        FileHeader {
            machine: MachineType::I386,
            number_of_sections: 0,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: 0xE0,
            characteristics: Characteristics::EXECUTABLE_IMAGE | Characteristics::MACHINE_32BIT,
        }
    }
}

impl FileHeader {
    /// Reads the 20-byte file header.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for an unknown machine type.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let raw_machine = reader.read_u16()?;
        let machine = MachineType::from_repr(raw_machine)
            .ok_or_else(|| malformed_error!("Unknown machine type - 0x{:04X}", raw_machine))?;

        Ok(FileHeader {
            machine,
            number_of_sections: reader.read_u16()?,
            time_date_stamp: reader.read_u32()?,
            pointer_to_symbol_table: reader.read_u32()?,
            number_of_symbols: reader.read_u32()?,
            size_of_optional_header: reader.read_u16()?,
            characteristics: Characteristics::from_bits_retain(reader.read_u16()?),
        })
    }

    /// Writes the 20-byte file header.
    ///
    /// # Errors
    /// Returns an error if the writer rejects the data.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_u16(self.machine as u16)?;
        writer.write_u16(self.number_of_sections)?;
        writer.write_u32(self.time_date_stamp)?;
        writer.write_u32(self.pointer_to_symbol_table)?;
        writer.write_u32(self.number_of_symbols)?;
        writer.write_u16(self.size_of_optional_header)?;
        writer.write_u16(self.characteristics.bits())
    }
}

/// Format of the optional header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u16)]
pub enum OptionalHeaderMagic {
    /// 32-bit image
    Pe32 = 0x10B,
    /// 64-bit image
    Pe32Plus = 0x20B,
}

/// The optional header (PE32 or PE32+), including the data directory table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OptionalHeader {
    pub magic: OptionalHeaderMagic,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// Only present in PE32 images.
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: SubSystem,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: Vec<DataDirectory>,
}

impl Default for OptionalHeader {
    fn default() -> Self {
        OptionalHeader {
            magic: OptionalHeaderMagic::Pe32,
            major_linker_version: 0x30,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            base_of_data: 0,
            image_base: 0x0040_0000,
            section_alignment: 0x2000,
            file_alignment: 0x200,
            major_operating_system_version: 4,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 4,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: 0,
            size_of_headers: 0,
            checksum: 0,
            subsystem: SubSystem::WindowsCui,
            dll_characteristics: DllCharacteristics::DYNAMIC_BASE
                | DllCharacteristics::NX_COMPAT
                | DllCharacteristics::NO_SEH
                | DllCharacteristics::TERMINAL_SERVER_AWARE,
            size_of_stack_reserve: 0x0010_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x0010_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: DEFAULT_NUMBER_OF_RVA_AND_SIZES as u32,
            data_directories: vec![DataDirectory::default(); DEFAULT_NUMBER_OF_RVA_AND_SIZES],
        }
    }
}

impl OptionalHeader {
    /// Reads the optional header.
    ///
    /// The data directory table is always read as 16 entries, independent of
    /// `NumberOfRvaAndSizes`, as the Windows loader does.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for an unknown magic or subsystem.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let raw_magic = reader.read_u16()?;
        let magic = OptionalHeaderMagic::from_repr(raw_magic).ok_or_else(|| {
            malformed_error!("Unrecognized or unsupported optional header format - 0x{:04X}", raw_magic)
        })?;
        let is_32bit = magic == OptionalHeaderMagic::Pe32;

        let major_linker_version = reader.read_u8()?;
        let minor_linker_version = reader.read_u8()?;
        let size_of_code = reader.read_u32()?;
        let size_of_initialized_data = reader.read_u32()?;
        let size_of_uninitialized_data = reader.read_u32()?;
        let address_of_entry_point = reader.read_u32()?;
        let base_of_code = reader.read_u32()?;

        let (base_of_data, image_base) = if is_32bit {
            (reader.read_u32()?, u64::from(reader.read_u32()?))
        } else {
            (0, reader.read_u64()?)
        };

        let section_alignment = reader.read_u32()?;
        let file_alignment = reader.read_u32()?;
        let major_operating_system_version = reader.read_u16()?;
        let minor_operating_system_version = reader.read_u16()?;
        let major_image_version = reader.read_u16()?;
        let minor_image_version = reader.read_u16()?;
        let major_subsystem_version = reader.read_u16()?;
        let minor_subsystem_version = reader.read_u16()?;
        let win32_version_value = reader.read_u32()?;
        let size_of_image = reader.read_u32()?;
        let size_of_headers = reader.read_u32()?;
        let checksum = reader.read_u32()?;

        let raw_subsystem = reader.read_u16()?;
        let subsystem = SubSystem::from_repr(raw_subsystem)
            .ok_or_else(|| malformed_error!("Unknown subsystem - {}", raw_subsystem))?;
        let dll_characteristics = DllCharacteristics::from_bits_retain(reader.read_u16()?);

        let size_of_stack_reserve = reader.read_native_int(is_32bit)?;
        let size_of_stack_commit = reader.read_native_int(is_32bit)?;
        let size_of_heap_reserve = reader.read_native_int(is_32bit)?;
        let size_of_heap_commit = reader.read_native_int(is_32bit)?;
        let loader_flags = reader.read_u32()?;
        let number_of_rva_and_sizes = reader.read_u32()?;

        let mut data_directories = Vec::with_capacity(DEFAULT_NUMBER_OF_RVA_AND_SIZES);
        for _ in 0..DEFAULT_NUMBER_OF_RVA_AND_SIZES {
            data_directories.push(DataDirectory::new(reader.read_u32()?, reader.read_u32()?));
        }

        Ok(OptionalHeader {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            checksum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
        })
    }

    /// Whether this is a PE32 header.
    #[must_use]
    pub fn is_32bit(&self) -> bool {
        self.magic == OptionalHeaderMagic::Pe32
    }

    /// Serialized size: `0xE0` for PE32, `0xF0` for PE32+.
    #[must_use]
    pub fn physical_size(&self) -> u32 {
        if self.is_32bit() {
            0xE0
        } else {
            0xF0
        }
    }

    /// The data directory at `index`, or an empty entry if the table is shorter.
    #[must_use]
    pub fn data_directory(&self, index: DataDirectoryIndex) -> DataDirectory {
        self.data_directories
            .get(index as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Replaces the data directory at `index`, growing the table if needed.
    pub fn set_data_directory(&mut self, index: DataDirectoryIndex, directory: DataDirectory) {
        let index = index as usize;
        if self.data_directories.len() <= index {
            self.data_directories
                .resize(index + 1, DataDirectory::default());
        }
        self.data_directories[index] = directory;
    }

    /// Writes the optional header, zero-padded to [`OptionalHeader::physical_size`].
    ///
    /// # Errors
    /// Returns an error if the writer rejects the data or the image base does not fit a PE32
    /// header.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let start = writer.offset();
        let is_32bit = self.is_32bit();

        writer.write_u16(self.magic as u16)?;
        writer.write_u8(self.major_linker_version)?;
        writer.write_u8(self.minor_linker_version)?;
        writer.write_u32(self.size_of_code)?;
        writer.write_u32(self.size_of_initialized_data)?;
        writer.write_u32(self.size_of_uninitialized_data)?;
        writer.write_u32(self.address_of_entry_point)?;
        writer.write_u32(self.base_of_code)?;
        if is_32bit {
            writer.write_u32(self.base_of_data)?;
        }
        writer.write_native_int(self.image_base, is_32bit)?;
        writer.write_u32(self.section_alignment)?;
        writer.write_u32(self.file_alignment)?;
        writer.write_u16(self.major_operating_system_version)?;
        writer.write_u16(self.minor_operating_system_version)?;
        writer.write_u16(self.major_image_version)?;
        writer.write_u16(self.minor_image_version)?;
        writer.write_u16(self.major_subsystem_version)?;
        writer.write_u16(self.minor_subsystem_version)?;
        writer.write_u32(self.win32_version_value)?;
        writer.write_u32(self.size_of_image)?;
        writer.write_u32(self.size_of_headers)?;
        writer.write_u32(self.checksum)?;
        writer.write_u16(self.subsystem as u16)?;
        writer.write_u16(self.dll_characteristics.bits())?;
        writer.write_native_int(self.size_of_stack_reserve, is_32bit)?;
        writer.write_native_int(self.size_of_stack_commit, is_32bit)?;
        writer.write_native_int(self.size_of_heap_reserve, is_32bit)?;
        writer.write_native_int(self.size_of_heap_commit, is_32bit)?;
        writer.write_u32(self.loader_flags)?;
        writer.write_u32(self.number_of_rva_and_sizes)?;

        for index in 0..DEFAULT_NUMBER_OF_RVA_AND_SIZES {
            let directory = self.data_directories.get(index).copied().unwrap_or_default();
            writer.write_u32(directory.virtual_address)?;
            writer.write_u32(directory.size)?;
        }

        let written = writer.offset() - start;
        let size = u64::from(self.physical_size());
        if written > size {
            return Err(Error::InvalidArgument(format!(
                "Optional header overflows its {size} byte slot"
            )));
        }
        writer.write_zeroes(size - written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStreamWriter;

    #[test]
    fn optional_header_sizes() {
        let mut header = OptionalHeader::default();
        let mut writer = MemoryStreamWriter::new();
        header.write(&mut writer).unwrap();
        assert_eq!(writer.length(), 0xE0);

        header.magic = OptionalHeaderMagic::Pe32Plus;
        let mut writer = MemoryStreamWriter::new();
        header.write(&mut writer).unwrap();
        assert_eq!(writer.length(), 0xF0);
    }

    #[test]
    fn optional_header_reads_back() {
        let mut header = OptionalHeader::default();
        header.magic = OptionalHeaderMagic::Pe32Plus;
        header.image_base = 0x1_4000_0000;
        header.set_data_directory(DataDirectoryIndex::Clr, DataDirectory::new(0x2008, 0x48));

        let mut writer = MemoryStreamWriter::new();
        header.write(&mut writer).unwrap();

        let mut reader = BinaryStreamReader::from_bytes(writer.into_inner());
        let parsed = OptionalHeader::from_reader(&mut reader).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(
            parsed.data_directory(DataDirectoryIndex::Clr),
            DataDirectory::new(0x2008, 0x48)
        );
    }

    #[test]
    fn unknown_magic_is_malformed() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0x07, 0x01, 0, 0]);
        assert!(matches!(
            OptionalHeader::from_reader(&mut reader),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn pe32_image_base_must_fit() {
        let header = OptionalHeader {
            image_base: 0x1_0000_0000,
            ..OptionalHeader::default()
        };
        let mut writer = MemoryStreamWriter::new();
        assert!(header.write(&mut writer).is_err());
    }

    #[test]
    fn dos_header_default_stub() {
        let header = DosHeader::default();
        let mut writer = MemoryStreamWriter::new();
        header.write(&mut writer).unwrap();

        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 0x80);
        assert_eq!(&bytes[..2], b"MZ");

        let mut reader = BinaryStreamReader::from_bytes(bytes);
        let parsed = DosHeader::from_reader(&mut reader).unwrap();
        assert_eq!(parsed.next_header_offset, 0x80);
        assert_eq!(reader.offset(), 0x80);
    }

    #[test]
    fn dotnet_os_override() {
        let machine = MachineType::from_repr(0x8664 ^ 0x7B79).unwrap();
        assert_eq!(machine, MachineType::Amd64DotNetLinux);
        assert_eq!(machine.base_machine(), MachineType::Amd64);
        assert_eq!(MachineType::I386.base_machine(), MachineType::I386);
    }
}
