//! Tables stream (`#~`, `#-`).
//!
//! The tables stream stores every metadata table back to back. Its header lists which tables
//! are present and how many rows each has; together with the heap size flags this determines
//! the width of every column. [`TablesStream`] computes that layout and reads individual
//! columns without materializing rows, which is all the image builder needs to locate and
//! patch the RVA columns of the `MethodDef` and `FieldRVA` tables.
//!
//! [`TablesStreamBuilder`] produces a tables stream from raw row values.
//!
//! # Reference
//! - [ECMA-335 II.24.2.6, II.22](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use std::collections::BTreeMap;

use bitflags::bitflags;
use strum::IntoEnumIterator;

use super::{CodedIndex, TableIndex, Token};
use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    Error, Result,
};

/// Name of the optimized tables stream.
pub const COMPRESSED_STREAM_NAME: &str = "#~";
/// Name of the unoptimized (edit and continue) tables stream.
pub const ENC_STREAM_NAME: &str = "#-";
/// Name of the stream whose presence forces 4-byte indices everywhere.
pub const MINIMAL_STREAM_NAME: &str = "#JTD";

/// Number of table slots in the `valid` bit vector.
pub const MAX_TABLES: usize = 64;

bitflags! {
    /// The `HeapSizes` byte of the tables stream header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TablesStreamFlags: u8 {
        /// Indices into `#Strings` are 4 bytes wide.
        const LONG_STRING_INDICES = 0x01;
        /// Indices into `#GUID` are 4 bytes wide.
        const LONG_GUID_INDICES = 0x02;
        /// Indices into `#Blob` are 4 bytes wide.
        const LONG_BLOB_INDICES = 0x04;
        /// Padding bit.
        const PADDING_BIT = 0x08;
        /// The stream only contains deltas.
        const DELTA_ONLY = 0x20;
        /// A 4-byte value follows the row counts.
        const EXTRA_DATA = 0x40;
        /// Rows may be marked as deleted.
        const HAS_DELETE = 0x80;
    }
}

/// Storage class of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 1-byte constant.
    Byte,
    /// 2-byte constant.
    UShort,
    /// 4-byte constant.
    UInt,
    /// Index into `#Strings`.
    StringIndex,
    /// Index into `#GUID`.
    GuidIndex,
    /// Index into `#Blob`.
    BlobIndex,
    /// Row id of a single table.
    Table(TableIndex),
    /// Coded index over several tables.
    Coded(CodedIndex),
}

/// Static description of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column name as written in ECMA-335.
    pub name: &'static str,
    /// Storage class.
    pub kind: ColumnType,
}

macro_rules! col {
    ($name:literal, $kind:expr) => {
        ColumnDescriptor {
            name: $name,
            kind: $kind,
        }
    };
}

/// Column positions used by the image builder.
pub mod columns {
    /// `MethodDef.RVA`
    pub const METHOD_DEF_RVA: usize = 0;
    /// `MethodDef.ImplFlags`
    pub const METHOD_DEF_IMPL_FLAGS: usize = 1;
    /// `MethodDef.Signature`
    pub const METHOD_DEF_SIGNATURE: usize = 4;
    /// `Field.Signature`
    pub const FIELD_SIGNATURE: usize = 2;
    /// `FieldRVA.RVA`
    pub const FIELD_RVA_RVA: usize = 0;
    /// `FieldRVA.Field`
    pub const FIELD_RVA_FIELD: usize = 1;
    /// `ClassLayout.PackingSize`
    pub const CLASS_LAYOUT_PACKING_SIZE: usize = 0;
    /// `ClassLayout.ClassSize`
    pub const CLASS_LAYOUT_CLASS_SIZE: usize = 1;
    /// `ClassLayout.Parent`
    pub const CLASS_LAYOUT_PARENT: usize = 2;
    /// `StandAloneSig.Signature`
    pub const STANDALONE_SIG_SIGNATURE: usize = 0;
}

/// The columns of `table`, in storage order.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn table_schema(table: TableIndex) -> &'static [ColumnDescriptor] {
    use CodedIndex as C;
    use ColumnType::{BlobIndex, Byte, Coded, GuidIndex, StringIndex, Table, UInt, UShort};
    use TableIndex as T;

    match table {
        T::Module => &[
            col!("Generation", UShort),
            col!("Name", StringIndex),
            col!("Mvid", GuidIndex),
            col!("EncId", GuidIndex),
            col!("EncBaseId", GuidIndex),
        ],
        T::TypeRef => &[
            col!("ResolutionScope", Coded(C::ResolutionScope)),
            col!("TypeName", StringIndex),
            col!("TypeNamespace", StringIndex),
        ],
        T::TypeDef => &[
            col!("Flags", UInt),
            col!("TypeName", StringIndex),
            col!("TypeNamespace", StringIndex),
            col!("Extends", Coded(C::TypeDefOrRef)),
            col!("FieldList", Table(T::Field)),
            col!("MethodList", Table(T::MethodDef)),
        ],
        T::FieldPtr => &[col!("Field", Table(T::Field))],
        T::Field => &[
            col!("Flags", UShort),
            col!("Name", StringIndex),
            col!("Signature", BlobIndex),
        ],
        T::MethodPtr => &[col!("Method", Table(T::MethodDef))],
        T::MethodDef => &[
            col!("RVA", UInt),
            col!("ImplFlags", UShort),
            col!("Flags", UShort),
            col!("Name", StringIndex),
            col!("Signature", BlobIndex),
            col!("ParamList", Table(T::Param)),
        ],
        T::ParamPtr => &[col!("Param", Table(T::Param))],
        T::Param => &[
            col!("Flags", UShort),
            col!("Sequence", UShort),
            col!("Name", StringIndex),
        ],
        T::InterfaceImpl => &[
            col!("Class", Table(T::TypeDef)),
            col!("Interface", Coded(C::TypeDefOrRef)),
        ],
        T::MemberRef => &[
            col!("Class", Coded(C::MemberRefParent)),
            col!("Name", StringIndex),
            col!("Signature", BlobIndex),
        ],
        T::Constant => &[
            col!("Type", Byte),
            col!("Padding", Byte),
            col!("Parent", Coded(C::HasConstant)),
            col!("Value", BlobIndex),
        ],
        T::CustomAttribute => &[
            col!("Parent", Coded(C::HasCustomAttribute)),
            col!("Type", Coded(C::CustomAttributeType)),
            col!("Value", BlobIndex),
        ],
        T::FieldMarshal => &[
            col!("Parent", Coded(C::HasFieldMarshal)),
            col!("NativeType", BlobIndex),
        ],
        T::DeclSecurity => &[
            col!("Action", UShort),
            col!("Parent", Coded(C::HasDeclSecurity)),
            col!("PermissionSet", BlobIndex),
        ],
        T::ClassLayout => &[
            col!("PackingSize", UShort),
            col!("ClassSize", UInt),
            col!("Parent", Table(T::TypeDef)),
        ],
        T::FieldLayout => &[col!("Offset", UInt), col!("Field", Table(T::Field))],
        T::StandAloneSig => &[col!("Signature", BlobIndex)],
        T::EventMap => &[
            col!("Parent", Table(T::TypeDef)),
            col!("EventList", Table(T::Event)),
        ],
        T::EventPtr => &[col!("Event", Table(T::Event))],
        T::Event => &[
            col!("EventFlags", UShort),
            col!("Name", StringIndex),
            col!("EventType", Coded(C::TypeDefOrRef)),
        ],
        T::PropertyMap => &[
            col!("Parent", Table(T::TypeDef)),
            col!("PropertyList", Table(T::Property)),
        ],
        T::PropertyPtr => &[col!("Property", Table(T::Property))],
        T::Property => &[
            col!("Flags", UShort),
            col!("Name", StringIndex),
            col!("Type", BlobIndex),
        ],
        T::MethodSemantics => &[
            col!("Semantics", UShort),
            col!("Method", Table(T::MethodDef)),
            col!("Association", Coded(C::HasSemantics)),
        ],
        T::MethodImpl => &[
            col!("Class", Table(T::TypeDef)),
            col!("MethodBody", Coded(C::MethodDefOrRef)),
            col!("MethodDeclaration", Coded(C::MethodDefOrRef)),
        ],
        T::ModuleRef => &[col!("Name", StringIndex)],
        T::TypeSpec => &[col!("Signature", BlobIndex)],
        T::ImplMap => &[
            col!("MappingFlags", UShort),
            col!("MemberForwarded", Coded(C::MemberForwarded)),
            col!("ImportName", StringIndex),
            col!("ImportScope", Table(T::ModuleRef)),
        ],
        T::FieldRva => &[col!("RVA", UInt), col!("Field", Table(T::Field))],
        T::EncLog => &[col!("Token", UInt), col!("FuncCode", UInt)],
        T::EncMap => &[col!("Token", UInt)],
        T::Assembly => &[
            col!("HashAlgId", UInt),
            col!("MajorVersion", UShort),
            col!("MinorVersion", UShort),
            col!("BuildNumber", UShort),
            col!("RevisionNumber", UShort),
            col!("Flags", UInt),
            col!("PublicKey", BlobIndex),
            col!("Name", StringIndex),
            col!("Culture", StringIndex),
        ],
        T::AssemblyProcessor => &[col!("Processor", UInt)],
        T::AssemblyOs => &[
            col!("OSPlatformID", UInt),
            col!("OSMajorVersion", UInt),
            col!("OSMinorVersion", UInt),
        ],
        T::AssemblyRef => &[
            col!("MajorVersion", UShort),
            col!("MinorVersion", UShort),
            col!("BuildNumber", UShort),
            col!("RevisionNumber", UShort),
            col!("Flags", UInt),
            col!("PublicKeyOrToken", BlobIndex),
            col!("Name", StringIndex),
            col!("Culture", StringIndex),
            col!("HashValue", BlobIndex),
        ],
        T::AssemblyRefProcessor => &[
            col!("Processor", UInt),
            col!("AssemblyRef", Table(T::AssemblyRef)),
        ],
        T::AssemblyRefOs => &[
            col!("OSPlatformId", UInt),
            col!("OSMajorVersion", UInt),
            col!("OSMinorVersion", UInt),
            col!("AssemblyRef", Table(T::AssemblyRef)),
        ],
        T::File => &[
            col!("Flags", UInt),
            col!("Name", StringIndex),
            col!("HashValue", BlobIndex),
        ],
        T::ExportedType => &[
            col!("Flags", UInt),
            col!("TypeDefId", UInt),
            col!("TypeName", StringIndex),
            col!("TypeNamespace", StringIndex),
            col!("Implementation", Coded(C::Implementation)),
        ],
        T::ManifestResource => &[
            col!("Offset", UInt),
            col!("Flags", UInt),
            col!("Name", StringIndex),
            col!("Implementation", Coded(C::Implementation)),
        ],
        T::NestedClass => &[
            col!("NestedClass", Table(T::TypeDef)),
            col!("EnclosingClass", Table(T::TypeDef)),
        ],
        T::GenericParam => &[
            col!("Number", UShort),
            col!("Flags", UShort),
            col!("Owner", Coded(C::TypeOrMethodDef)),
            col!("Name", StringIndex),
        ],
        T::MethodSpec => &[
            col!("Method", Coded(C::MethodDefOrRef)),
            col!("Instantiation", BlobIndex),
        ],
        T::GenericParamConstraint => &[
            col!("Owner", Table(T::GenericParam)),
            col!("Constraint", Coded(C::TypeDefOrRef)),
        ],
        T::Document => &[
            col!("Name", BlobIndex),
            col!("HashAlgorithm", GuidIndex),
            col!("Hash", BlobIndex),
            col!("Language", GuidIndex),
        ],
        T::MethodDebugInformation => &[
            col!("Document", Table(T::Document)),
            col!("SequencePoints", BlobIndex),
        ],
        T::LocalScope => &[
            col!("Method", Table(T::MethodDef)),
            col!("ImportScope", Table(T::ImportScope)),
            col!("VariableList", Table(T::LocalVariable)),
            col!("ConstantList", Table(T::LocalConstant)),
            col!("StartOffset", UInt),
            col!("Length", UInt),
        ],
        T::LocalVariable => &[
            col!("Attributes", UShort),
            col!("Index", UShort),
            col!("Name", StringIndex),
        ],
        T::LocalConstant => &[col!("Name", StringIndex), col!("Signature", BlobIndex)],
        T::ImportScope => &[
            col!("Parent", Table(T::ImportScope)),
            col!("Imports", BlobIndex),
        ],
        T::StateMachineMethod => &[
            col!("MoveNextMethod", Table(T::MethodDef)),
            col!("KickoffMethod", Table(T::MethodDef)),
        ],
        T::CustomDebugInformation => &[
            col!("Parent", Coded(C::HasCustomDebugInformation)),
            col!("Kind", GuidIndex),
            col!("Value", BlobIndex),
        ],
        T::String => &[],
    }
}

/// Position and width of a column within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    /// Static description.
    pub descriptor: ColumnDescriptor,
    /// Offset within the row.
    pub offset: u32,
    /// Width in bytes (1, 2 or 4).
    pub size: u32,
}

/// Column layout of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    /// Columns in storage order.
    pub columns: Vec<ColumnLayout>,
    /// Size of one row.
    pub row_size: u32,
}

/// Computes the layout of every table from the row counts and heap size flags.
///
/// `force_large` makes every index column 4 bytes wide, as runtimes do when a `#JTD` stream is
/// present.
#[must_use]
pub fn compute_layouts(
    row_counts: &[u32; MAX_TABLES],
    flags: TablesStreamFlags,
    force_large: bool,
) -> Vec<Option<TableLayout>> {
    let row_count = |table: TableIndex| row_counts[table as usize];
    let heap = |flag: TablesStreamFlags| {
        if force_large || flags.contains(flag) {
            4
        } else {
            2
        }
    };

    let mut layouts = vec![None; MAX_TABLES];
    for table in TableIndex::iter().filter(|&table| table != TableIndex::String) {
        let mut offset = 0;
        let columns = table_schema(table)
            .iter()
            .map(|&descriptor| {
                let size = match descriptor.kind {
                    ColumnType::Byte => 1,
                    ColumnType::UShort => 2,
                    ColumnType::UInt => 4,
                    ColumnType::StringIndex => heap(TablesStreamFlags::LONG_STRING_INDICES),
                    ColumnType::GuidIndex => heap(TablesStreamFlags::LONG_GUID_INDICES),
                    ColumnType::BlobIndex => heap(TablesStreamFlags::LONG_BLOB_INDICES),
                    ColumnType::Table(_) | ColumnType::Coded(_) if force_large => 4,
                    ColumnType::Table(target) => {
                        if row_count(target) < 0x1_0000 {
                            2
                        } else {
                            4
                        }
                    }
                    ColumnType::Coded(coded) => coded.size(row_count),
                };
                let layout = ColumnLayout {
                    descriptor,
                    offset,
                    size,
                };
                offset += size;
                layout
            })
            .collect();

        layouts[table as usize] = Some(TableLayout {
            columns,
            row_size: offset,
        });
    }
    layouts
}

/// The fixed part of the tables stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablesStreamHeader {
    /// Reserved, 0.
    pub reserved: u32,
    /// Schema major version, usually 2.
    pub major_version: u8,
    /// Schema minor version, usually 0.
    pub minor_version: u8,
    /// Heap size and stream flags.
    pub flags: TablesStreamFlags,
    /// Log2 of the largest rid (reserved byte).
    pub log2_largest_rid: u8,
    /// Bit vector of present tables.
    pub valid: u64,
    /// Bit vector of sorted tables.
    pub sorted: u64,
    /// Row count per table index; 0 for absent tables.
    pub row_counts: [u32; MAX_TABLES],
    /// Value following the row counts when [`TablesStreamFlags::EXTRA_DATA`] is set.
    pub extra_data: Option<u32>,
}

impl Default for TablesStreamHeader {
    fn default() -> Self {
        TablesStreamHeader {
            reserved: 0,
            major_version: 2,
            minor_version: 0,
            flags: TablesStreamFlags::empty(),
            log2_largest_rid: 1,
            valid: 0,
            sorted: 0x0000_1600_3301_FA00,
            row_counts: [0; MAX_TABLES],
            extra_data: None,
        }
    }
}

impl TablesStreamHeader {
    /// Reads the header and row counts.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for row counts that exceed the rid range.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let reserved = reader.read_u32()?;
        let major_version = reader.read_u8()?;
        let minor_version = reader.read_u8()?;
        let flags = TablesStreamFlags::from_bits_retain(reader.read_u8()?);
        let log2_largest_rid = reader.read_u8()?;
        let valid = reader.read_u64()?;
        let sorted = reader.read_u64()?;

        let mut row_counts = [0u32; MAX_TABLES];
        for (index, count) in row_counts.iter_mut().enumerate() {
            if valid & (1 << index) != 0 {
                *count = reader.read_u32()?;
                if *count > 0x00FF_FFFF {
                    return Err(malformed_error!(
                        "Table 0x{:02X} declares {} rows",
                        index,
                        count
                    ));
                }
            }
        }

        let extra_data = if flags.contains(TablesStreamFlags::EXTRA_DATA) {
            Some(reader.read_u32()?)
        } else {
            None
        };

        Ok(TablesStreamHeader {
            reserved,
            major_version,
            minor_version,
            flags,
            log2_largest_rid,
            valid,
            sorted,
            row_counts,
            extra_data,
        })
    }

    /// Serialized size of the header and row counts.
    #[must_use]
    pub fn size(&self) -> u32 {
        24 + 4 * self.valid.count_ones() + if self.extra_data.is_some() { 4 } else { 0 }
    }

    /// Writes the header and row counts.
    ///
    /// # Errors
    /// Returns an error if the writer fails.
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        writer.write_u32(self.reserved)?;
        writer.write_u8(self.major_version)?;
        writer.write_u8(self.minor_version)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u8(self.log2_largest_rid)?;
        writer.write_u64(self.valid)?;
        writer.write_u64(self.sorted)?;
        for (index, count) in self.row_counts.iter().enumerate() {
            if self.valid & (1 << index) != 0 {
                writer.write_u32(*count)?;
            }
        }
        if let Some(extra) = self.extra_data {
            writer.write_u32(extra)?;
        }
        Ok(())
    }
}

/// A parsed tables stream: header plus computed layout over the raw stream bytes.
#[derive(Debug, Clone)]
pub struct TablesStream {
    name: String,
    header: TablesStreamHeader,
    layouts: Vec<Option<TableLayout>>,
    table_offsets: [u32; MAX_TABLES],
    reader: BinaryStreamReader,
}

impl TablesStream {
    /// Parses the header of the stream covered by `reader`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the declared tables do not fit the stream.
    pub fn from_reader(
        name: impl Into<String>,
        reader: BinaryStreamReader,
        force_large: bool,
    ) -> Result<Self> {
        let mut cursor = reader.fork();
        let header = TablesStreamHeader::from_reader(&mut cursor)?;
        let layouts = compute_layouts(&header.row_counts, header.flags, force_large);

        let mut table_offsets = [0u32; MAX_TABLES];
        let mut offset = u64::from(header.size());
        for (index, layout) in layouts.iter().enumerate() {
            table_offsets[index] = u32::try_from(offset)
                .map_err(|_| malformed_error!("Tables stream exceeds 4 GiB"))?;
            if let Some(layout) = layout {
                offset += u64::from(layout.row_size) * u64::from(header.row_counts[index]);
            }
        }

        if offset > u64::from(reader.length()) {
            return Err(malformed_error!(
                "Tables require 0x{:X} bytes but the stream only has 0x{:X}",
                offset,
                reader.length()
            ));
        }

        Ok(TablesStream {
            name: name.into(),
            header,
            layouts,
            table_offsets,
            reader,
        })
    }

    /// Name of the stream (`#~` or `#-`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stream header.
    #[must_use]
    pub fn header(&self) -> &TablesStreamHeader {
        &self.header
    }

    /// Reader over the whole stream.
    #[must_use]
    pub fn reader(&self) -> &BinaryStreamReader {
        &self.reader
    }

    /// Number of rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: TableIndex) -> u32 {
        self.header
            .row_counts
            .get(table as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Column layout of `table`.
    #[must_use]
    pub fn layout(&self, table: TableIndex) -> Option<&TableLayout> {
        self.layouts.get(table as usize).and_then(Option::as_ref)
    }

    /// Offset of `table`, relative to the start of the stream.
    #[must_use]
    pub fn table_offset(&self, table: TableIndex) -> u32 {
        self.table_offsets
            .get(table as usize)
            .copied()
            .unwrap_or(0)
    }

    fn checked_layout(&self, table: TableIndex, rid: u32) -> Result<&TableLayout> {
        let count = self.row_count(table);
        if rid == 0 || rid > count {
            return Err(Error::IndexOutOfRange {
                index: rid as usize,
                count: count as usize,
            });
        }
        self.layout(table)
            .ok_or_else(|| not_supported_error!("Table {} has no layout", table))
    }

    /// Offset of row `rid` (1-based) of `table`, relative to the start of the stream.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for a rid outside the table.
    pub fn row_offset(&self, table: TableIndex, rid: u32) -> Result<u32> {
        let layout = self.checked_layout(table, rid)?;
        Ok(self.table_offset(table) + (rid - 1) * layout.row_size)
    }

    /// Offset of a column of row `rid`, relative to the start of the stream.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for a rid or column outside the table.
    pub fn column_offset(&self, table: TableIndex, rid: u32, column: usize) -> Result<u32> {
        let layout = self.checked_layout(table, rid)?;
        let column = layout.columns.get(column).ok_or(Error::IndexOutOfRange {
            index: column,
            count: layout.columns.len(),
        })?;
        Ok(self.row_offset(table, rid)? + column.offset)
    }

    /// Reads one column of row `rid`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for a rid or column outside the table.
    pub fn read_column(&self, table: TableIndex, rid: u32, column: usize) -> Result<u32> {
        let layout = self.checked_layout(table, rid)?;
        let descriptor = layout.columns.get(column).ok_or(Error::IndexOutOfRange {
            index: column,
            count: layout.columns.len(),
        })?;

        let offset = self.row_offset(table, rid)? + descriptor.offset;
        let mut reader = self.reader.fork_relative(u64::from(offset))?;
        match descriptor.size {
            1 => Ok(u32::from(reader.read_u8()?)),
            2 => Ok(u32::from(reader.read_u16()?)),
            _ => reader.read_u32(),
        }
    }

    /// Reads all columns of row `rid`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for a rid outside the table.
    pub fn read_row(&self, table: TableIndex, rid: u32) -> Result<Vec<u32>> {
        let layout = self.checked_layout(table, rid)?;
        (0..layout.columns.len())
            .map(|column| self.read_column(table, rid, column))
            .collect()
    }

    /// Reads a coded index column and decodes it to a token.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the column is not a coded index.
    pub fn read_coded_index(&self, table: TableIndex, rid: u32, column: usize) -> Result<Token> {
        let layout = self.checked_layout(table, rid)?;
        let kind = match layout.columns.get(column).map(|c| c.descriptor.kind) {
            Some(ColumnType::Coded(kind)) => kind,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "Column {column} of {table} is not a coded index"
                )))
            }
        };
        kind.decode(self.read_column(table, rid, column)?)
    }

    /// Finds the first row of `table` whose `column` equals `key`.
    ///
    /// # Errors
    /// Returns an error if a row cannot be read.
    pub fn find_row(&self, table: TableIndex, column: usize, key: u32) -> Result<Option<u32>> {
        for rid in 1..=self.row_count(table) {
            if self.read_column(table, rid, column)? == key {
                return Ok(Some(rid));
            }
        }
        Ok(None)
    }
}

/// Builds a tables stream from raw row values.
///
/// Column widths are derived from the final row counts, so rows can be added in any order.
#[derive(Debug, Clone, Default)]
pub struct TablesStreamBuilder {
    /// Header template; `valid` and `row_counts` are recomputed on build.
    pub header: TablesStreamHeader,
    /// Forces 4-byte index columns.
    pub force_large: bool,
    rows: BTreeMap<TableIndex, Vec<Vec<u32>>>,
}

impl TablesStreamBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the number of values does not match the schema.
    pub fn add_row(&mut self, table: TableIndex, values: Vec<u32>) -> Result<Token> {
        let expected = table_schema(table).len();
        if expected == 0 {
            return Err(Error::InvalidArgument(format!("{table} is not a metadata table")));
        }
        if values.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "{table} rows have {expected} columns, got {}",
                values.len()
            )));
        }

        let rows = self.rows.entry(table).or_default();
        rows.push(values);
        #[allow(clippy::cast_possible_truncation)]
        Ok(Token::from_parts(table, rows.len() as u32))
    }

    /// Number of rows added to `table`.
    #[must_use]
    pub fn row_count(&self, table: TableIndex) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        self.rows.get(&table).map_or(0, |rows| rows.len() as u32)
    }

    /// Serializes the stream, padded to 4 bytes.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if a value does not fit its column.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut header = self.header.clone();
        header.valid = 0;
        header.row_counts = [0; MAX_TABLES];
        for (table, rows) in &self.rows {
            if !rows.is_empty() {
                header.valid |= 1 << (*table as u8);
                header.row_counts[*table as usize] = crate::utils::to_u32(rows.len())?;
            }
        }

        let layouts = compute_layouts(&header.row_counts, header.flags, self.force_large);

        let mut writer = MemoryStreamWriter::new();
        header.write(&mut writer)?;
        for (table, rows) in &self.rows {
            let Some(layout) = &layouts[*table as usize] else {
                continue;
            };
            for row in rows {
                for (value, column) in row.iter().zip(&layout.columns) {
                    match column.size {
                        1 => writer.write_u8(narrow(*value, *table, column)?)?,
                        2 => writer.write_u16(narrow(*value, *table, column)?)?,
                        _ => writer.write_u32(*value)?,
                    }
                }
            }
        }
        writer.align(4)?;
        Ok(writer.into_inner())
    }
}

fn narrow<T: TryFrom<u32>>(value: u32, table: TableIndex, column: &ColumnLayout) -> Result<T> {
    T::try_from(value).map_err(|_| {
        Error::InvalidArgument(format!(
            "Value 0x{value:X} does not fit {}.{} ({} bytes)",
            table, column.descriptor.name, column.size
        ))
    })
}
