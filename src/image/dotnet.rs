//! The CLR (.NET) data directory.
//!
//! A [`DotNetDirectory`] holds the COR20 header values, the metadata directory and the
//! auxiliary blobs the header points at. Method bodies and field initialization data stay
//! where the metadata tables say they are; entries in [`DotNetDirectory::method_bodies`] and
//! [`DotNetDirectory::field_data`] replace them when the image is rebuilt.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bitflags::bitflags;

use crate::{
    diagnostics::ErrorListener,
    metadata::{Cor20Header, DotNetDirectoryFlags, Metadata},
    pe::{DataDirectory, DataDirectoryIndex, PeFile},
    segment::{Segment, SegmentRef},
    Result,
};

bitflags! {
    /// `MethodDef.ImplFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodImplAttributes: u16 {
        /// Mask of the code type bits.
        const CODE_TYPE_MASK = 0x0003;
        /// The body is CIL.
        const IL = 0x0000;
        /// The body is native code.
        const NATIVE = 0x0001;
        /// The body is optimized CIL.
        const OPTIL = 0x0002;
        /// The body is provided by the runtime.
        const RUNTIME = 0x0003;
        /// The body is unmanaged code.
        const UNMANAGED = 0x0004;
        /// The method cannot be inlined.
        const NO_INLINING = 0x0008;
        /// The method is defined elsewhere.
        const FORWARD_REF = 0x0010;
        /// The method is single-threaded through its body.
        const SYNCHRONIZED = 0x0020;
        /// The method cannot be optimized by the JIT.
        const NO_OPTIMIZATION = 0x0040;
        /// The signature is exported exactly as declared.
        const PRESERVE_SIG = 0x0080;
        /// The method should be inlined if possible.
        const AGGRESSIVE_INLINING = 0x0100;
        /// The method should be optimized aggressively.
        const AGGRESSIVE_OPTIMIZATION = 0x0200;
        /// Reserved for internal use.
        const INTERNAL_CALL = 0x1000;
    }
}

impl MethodImplAttributes {
    /// Whether the code type bits select CIL.
    #[must_use]
    pub fn is_il(self) -> bool {
        self.bits() & Self::CODE_TYPE_MASK.bits() == Self::IL.bits()
    }

    /// Whether the code type bits select native code.
    #[must_use]
    pub fn is_native(self) -> bool {
        self.bits() & Self::CODE_TYPE_MASK.bits() == Self::NATIVE.bits()
    }
}

/// The contents of the CLR data directory.
#[derive(Clone, Default)]
pub struct DotNetDirectory {
    /// Minimum runtime major version.
    pub major_runtime_version: u16,
    /// Minimum runtime minor version.
    pub minor_runtime_version: u16,
    /// Runtime flags.
    pub flags: DotNetDirectoryFlags,
    /// Entry point token, or RVA with [`DotNetDirectoryFlags::NATIVE_ENTRY_POINT`].
    pub entry_point: u32,
    /// The metadata directory.
    pub metadata: Option<Arc<Metadata>>,
    /// Managed resources blob.
    pub resources: Option<SegmentRef>,
    /// Strong name signature.
    pub strong_name: Option<SegmentRef>,
    /// Code manager table (unused by current runtimes).
    pub code_manager_table: Option<SegmentRef>,
    /// VTable fixups.
    pub vtable_fixups: Option<SegmentRef>,
    /// Export address table jumps.
    pub export_address_table: Option<SegmentRef>,
    /// Managed native (ReadyToRun) header.
    pub managed_native_header: Option<SegmentRef>,
    /// Replacement bodies by `MethodDef` rid.
    pub method_bodies: BTreeMap<u32, SegmentRef>,
    /// Replacement initialization data by `FieldRVA` rid.
    pub field_data: BTreeMap<u32, SegmentRef>,
}

impl DotNetDirectory {
    /// Creates a directory for runtime 2.5 around `metadata`.
    #[must_use]
    pub fn new(metadata: Arc<Metadata>) -> Self {
        DotNetDirectory {
            major_runtime_version: 2,
            minor_runtime_version: 5,
            flags: DotNetDirectoryFlags::IL_ONLY,
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    /// Whether the image contains native code besides CIL.
    #[must_use]
    pub fn is_il_only(&self) -> bool {
        self.flags.contains(DotNetDirectoryFlags::IL_ONLY)
    }

    /// The header values, with every directory set to the current location of its segment.
    /// `metadata` is the segment the metadata directory was placed in.
    #[must_use]
    pub fn create_header(&self, metadata: Option<&SegmentRef>) -> Cor20Header {
        Cor20Header {
            cb: Cor20Header::SIZE,
            major_runtime_version: self.major_runtime_version,
            minor_runtime_version: self.minor_runtime_version,
            metadata: directory_of(metadata),
            flags: self.flags,
            entry_point: self.entry_point,
            resources: directory_of(self.resources.as_ref()),
            strong_name_signature: directory_of(self.strong_name.as_ref()),
            code_manager_table: directory_of(self.code_manager_table.as_ref()),
            vtable_fixups: directory_of(self.vtable_fixups.as_ref()),
            export_address_table_jumps: directory_of(self.export_address_table.as_ref()),
            managed_native_header: directory_of(self.managed_native_header.as_ref()),
        }
    }
}

/// The directory entry for an optional segment, empty when absent.
#[must_use]
pub fn directory_of(segment: Option<&SegmentRef>) -> DataDirectory {
    segment.map_or_else(DataDirectory::default, |segment| {
        DataDirectory::new(segment.rva(), segment.physical_size())
    })
}

impl fmt::Debug for DotNetDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DotNetDirectory")
            .field("runtime", &format_args!("{}.{}", self.major_runtime_version, self.minor_runtime_version))
            .field("flags", &self.flags)
            .field("entry_point", &format_args!("0x{:08X}", self.entry_point))
            .field("metadata", &self.metadata)
            .field("method_bodies", &self.method_bodies.len())
            .field("field_data", &self.field_data.len())
            .finish_non_exhaustive()
    }
}

fn read_blob(
    file: &PeFile,
    directory: DataDirectory,
    name: &str,
    listener: &dyn ErrorListener,
) -> Result<Option<SegmentRef>> {
    if !directory.is_present() || directory.size == 0 {
        return Ok(None);
    }
    match file
        .create_reader_at_rva_sized(directory.virtual_address, directory.size)
        .and_then(|mut reader| reader.read_segment(directory.size))
    {
        Ok(segment) => Ok(Some(Arc::new(segment))),
        Err(error) => {
            listener.bad_image(&format!("Invalid {name} directory: {error}"))?;
            Ok(None)
        }
    }
}

/// Reads the CLR data directory of `file`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for an invalid COR20 header, or whatever `listener`
/// escalates for unreadable sub-directories.
pub fn read_dotnet_directory(file: &PeFile, listener: &dyn ErrorListener) -> Result<Option<DotNetDirectory>> {
    let directory = file.data_directory(DataDirectoryIndex::Clr);
    if !directory.is_present() {
        return Ok(None);
    }

    let mut reader = match file.create_reader_at_rva(directory.virtual_address) {
        Ok(reader) => reader,
        Err(error) => {
            listener.bad_image(&format!("CLR directory is not mapped: {error}"))?;
            return Ok(None);
        }
    };
    let header = Cor20Header::from_reader(&mut reader)?;

    let metadata = if header.metadata.is_present() {
        let metadata = file
            .create_reader_at_rva_sized(header.metadata.virtual_address, header.metadata.size)
            .and_then(Metadata::from_reader);
        match metadata {
            Ok(metadata) => Some(Arc::new(metadata)),
            Err(error) => {
                listener.bad_image(&format!("Invalid metadata directory: {error}"))?;
                None
            }
        }
    } else {
        None
    };

    tracing::debug!(
        runtime = %format_args!("{}.{}", header.major_runtime_version, header.minor_runtime_version),
        flags = ?header.flags,
        "read CLR directory"
    );

    Ok(Some(DotNetDirectory {
        major_runtime_version: header.major_runtime_version,
        minor_runtime_version: header.minor_runtime_version,
        flags: header.flags,
        entry_point: header.entry_point,
        metadata,
        resources: read_blob(file, header.resources, "managed resources", listener)?,
        strong_name: read_blob(file, header.strong_name_signature, "strong name", listener)?,
        code_manager_table: read_blob(file, header.code_manager_table, "code manager table", listener)?,
        vtable_fixups: read_blob(file, header.vtable_fixups, "VTable fixups", listener)?,
        export_address_table: read_blob(
            file,
            header.export_address_table_jumps,
            "export address table jumps",
            listener,
        )?,
        managed_native_header: read_blob(
            file,
            header.managed_native_header,
            "managed native header",
            listener,
        )?,
        method_bodies: BTreeMap::new(),
        field_data: BTreeMap::new(),
    }))
}
