//! The interpreted view of a PE image.
//!
//! [`PeImage`] sits on top of a [`PeFile`] and exposes its data directories as structured,
//! mutable values: imports, exports, base relocations, debug entries, Win32 resources and the
//! CLR directory. Members of an image read from a file are parsed on first access, so
//! inspecting only the imports of a large image never touches its resources.
//!
//! Images are turned back into files by [`crate::builder::PeFileBuilder`].
//!
//! ```rust,no_run
//! use peweave::image::PeImage;
//!
//! let image = PeImage::from_path("app.exe")?;
//! for module in image.imports()? {
//!     println!("{module}");
//! }
//! # Ok::<(), peweave::Error>(())
//! ```

mod debug;
mod dotnet;
mod exports;
mod fieldrva;
mod imports;
mod relocations;
mod resources;

pub use debug::{read_debug_entries, DebugDataEntry, DebugDataType, DEBUG_DIRECTORY_ENTRY_SIZE};
pub use dotnet::{directory_of, read_dotnet_directory, DotNetDirectory, MethodImplAttributes};
pub use exports::{
    read_exports, ExportAddress, ExportDirectory, ExportedSymbol, EXPORT_DIRECTORY_SIZE,
};
pub use fieldrva::{DefaultFieldRvaDataReader, FieldRvaDataReader};
pub use imports::{find_import_address, read_imports, ImportedModule, ImportedSymbol, IMPORT_DESCRIPTOR_SIZE};
pub use relocations::{
    read_relocations, BaseRelocation, RelocationType, RELOCATION_BLOCK_HEADER_SIZE,
};
pub use resources::{
    read_resources, ResourceData, ResourceDirectory, ResourceEntry, ResourceIdentifier,
    MAX_RESOURCE_DEPTH, RESOURCE_DATA_ENTRY_SIZE, RESOURCE_ENTRY_SIZE, RESOURCE_TABLE_SIZE,
};

use std::{fmt, path::Path, sync::Arc};

use crate::{
    diagnostics::{ErrorListener, ErrorListenerRef},
    lazy::{LazyList, LazyVariable},
    pe::{
        Characteristics, DllCharacteristics, MachineType, OptionalHeaderMagic, PeFile,
        ReaderParameters, SubSystem,
    },
    Result,
};

/// A PE image with its data directories interpreted.
pub struct PeImage {
    file: Option<Arc<PeFile>>,
    /// Target machine.
    pub machine_type: MachineType,
    /// COFF characteristics.
    pub characteristics: Characteristics,
    /// Link time stamp.
    pub time_date_stamp: u32,
    /// PE32 or PE32+.
    pub pe_kind: OptionalHeaderMagic,
    /// Subsystem required to run the image.
    pub subsystem: SubSystem,
    /// Loader flags.
    pub dll_characteristics: DllCharacteristics,
    /// Preferred load address.
    pub image_base: u64,
    imports: LazyList<ImportedModule>,
    exports: LazyVariable<Option<ExportDirectory>>,
    relocations: LazyList<BaseRelocation>,
    debug_data: LazyList<DebugDataEntry>,
    resources: LazyVariable<Option<ResourceDirectory>>,
    dotnet: LazyVariable<Option<DotNetDirectory>>,
}

impl PeImage {
    fn with_headers(file: &PeFile) -> Self {
        PeImage {
            file: None,
            machine_type: file.file_header.machine,
            characteristics: file.file_header.characteristics,
            time_date_stamp: file.file_header.time_date_stamp,
            pe_kind: file.optional_header.magic,
            subsystem: file.optional_header.subsystem,
            dll_characteristics: file.optional_header.dll_characteristics,
            image_base: file.optional_header.image_base,
            imports: LazyList::new(),
            exports: LazyVariable::new(None),
            relocations: LazyList::new(),
            debug_data: LazyList::new(),
            resources: LazyVariable::new(None),
            dotnet: LazyVariable::new(None),
        }
    }

    /// Creates an empty image for `machine` with the default headers of
    /// [`PeFile::with_machine`].
    #[must_use]
    pub fn new(machine: MachineType) -> Self {
        Self::with_headers(&PeFile::with_machine(machine))
    }

    /// Interprets `file`, failing on the first malformed directory.
    #[must_use]
    pub fn from_file(file: PeFile) -> Self {
        Self::from_file_with(file, &ReaderParameters::default())
    }

    /// Interprets `file`, reporting malformed directories to the listener of `parameters`.
    ///
    /// Nothing is parsed yet; each directory is read when its accessor is first called.
    #[must_use]
    pub fn from_file_with(file: PeFile, parameters: &ReaderParameters) -> Self {
        let mut image = Self::with_headers(&file);
        let file = Arc::new(file);
        let listener = parameters.error_listener.clone();

        image.imports = LazyList::with_factory(deferred(&file, &listener, read_imports));
        image.exports = LazyVariable::with_factory(deferred(&file, &listener, read_exports));
        image.relocations = LazyList::with_factory(deferred(&file, &listener, read_relocations));
        image.debug_data = LazyList::with_factory(deferred(&file, &listener, read_debug_entries));
        image.resources = LazyVariable::with_factory(deferred(&file, &listener, read_resources));
        image.dotnet = LazyVariable::with_factory(deferred(&file, &listener, read_dotnet_directory));
        image.file = Some(file);
        image
    }

    /// Parses an unmapped file held in memory.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the headers are invalid.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Ok(Self::from_file(PeFile::from_bytes(data)?))
    }

    /// Memory-maps and parses the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be mapped, or
    /// [`crate::Error::Malformed`] if the headers are invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_file(PeFile::from_path(path)?))
    }

    /// The file this image was read from.
    #[must_use]
    pub fn file(&self) -> Option<&Arc<PeFile>> {
        self.file.as_ref()
    }

    /// Whether the image uses 32-bit pointers.
    #[must_use]
    pub fn is_32bit(&self) -> bool {
        self.pe_kind == OptionalHeaderMagic::Pe32
    }

    /// Whether the image is a library.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.characteristics.contains(Characteristics::DLL)
    }

    /// Modules imported by the image.
    ///
    /// # Errors
    /// Returns the error of the import directory reader.
    pub fn imports(&self) -> Result<&[ImportedModule]> {
        self.imports.items()
    }

    /// Modules imported by the image, for modification.
    ///
    /// # Errors
    /// Returns the error of the import directory reader.
    pub fn imports_mut(&mut self) -> Result<&mut Vec<ImportedModule>> {
        self.imports.items_mut()
    }

    /// The export directory.
    ///
    /// # Errors
    /// Returns the error of the export directory reader.
    pub fn exports(&self) -> Result<Option<&ExportDirectory>> {
        Ok(self.exports.get()?.as_ref())
    }

    /// The export directory, for modification.
    ///
    /// # Errors
    /// Returns the error of the export directory reader.
    pub fn exports_mut(&mut self) -> Result<&mut Option<ExportDirectory>> {
        self.exports.get_mut()
    }

    /// Replaces the export directory.
    pub fn set_exports(&mut self, exports: Option<ExportDirectory>) {
        self.exports.set(exports);
    }

    /// Base relocations of the image.
    ///
    /// # Errors
    /// Returns the error of the relocation directory reader.
    pub fn relocations(&self) -> Result<&[BaseRelocation]> {
        self.relocations.items()
    }

    /// Base relocations of the image, for modification.
    ///
    /// # Errors
    /// Returns the error of the relocation directory reader.
    pub fn relocations_mut(&mut self) -> Result<&mut Vec<BaseRelocation>> {
        self.relocations.items_mut()
    }

    /// Debug directory entries.
    ///
    /// # Errors
    /// Returns the error of the debug directory reader.
    pub fn debug_data(&self) -> Result<&[DebugDataEntry]> {
        self.debug_data.items()
    }

    /// Debug directory entries, for modification.
    ///
    /// # Errors
    /// Returns the error of the debug directory reader.
    pub fn debug_data_mut(&mut self) -> Result<&mut Vec<DebugDataEntry>> {
        self.debug_data.items_mut()
    }

    /// Root of the Win32 resource tree.
    ///
    /// # Errors
    /// Returns the error of the resource directory reader.
    pub fn resources(&self) -> Result<Option<&ResourceDirectory>> {
        Ok(self.resources.get()?.as_ref())
    }

    /// Root of the Win32 resource tree, for modification.
    ///
    /// # Errors
    /// Returns the error of the resource directory reader.
    pub fn resources_mut(&mut self) -> Result<&mut Option<ResourceDirectory>> {
        self.resources.get_mut()
    }

    /// Replaces the resource tree.
    pub fn set_resources(&mut self, resources: Option<ResourceDirectory>) {
        self.resources.set(resources);
    }

    /// The CLR directory of a .NET image.
    ///
    /// # Errors
    /// Returns the error of the CLR directory reader.
    pub fn dotnet(&self) -> Result<Option<&DotNetDirectory>> {
        Ok(self.dotnet.get()?.as_ref())
    }

    /// The CLR directory, for modification.
    ///
    /// # Errors
    /// Returns the error of the CLR directory reader.
    pub fn dotnet_mut(&mut self) -> Result<&mut Option<DotNetDirectory>> {
        self.dotnet.get_mut()
    }

    /// Replaces the CLR directory.
    pub fn set_dotnet(&mut self, dotnet: Option<DotNetDirectory>) {
        self.dotnet.set(dotnet);
    }
}

fn deferred<T>(
    file: &Arc<PeFile>,
    listener: &ErrorListenerRef,
    read: fn(&PeFile, &dyn ErrorListener) -> Result<T>,
) -> impl Fn() -> Result<T> + Send + Sync + 'static
where
    T: 'static,
{
    let file = Arc::clone(file);
    let listener = Arc::clone(listener);
    move || read(&file, listener.as_ref())
}

impl fmt::Debug for PeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeImage")
            .field("machine_type", &self.machine_type)
            .field("characteristics", &self.characteristics)
            .field("pe_kind", &self.pe_kind)
            .field("image_base", &format_args!("0x{:X}", self.image_base))
            .field("from_file", &self.file.is_some())
            .finish_non_exhaustive()
    }
}
