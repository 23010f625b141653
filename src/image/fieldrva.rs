//! Initialization data of fields with an RVA.
//!
//! The `FieldRVA` table only stores where the data starts. Its size has to be derived from the
//! field's type: primitives have a fixed width, native integers and pointers depend on the
//! bitness the image is loaded with, and value types take the `ClassSize` of their
//! `ClassLayout` row.

use std::sync::Arc;

use crate::{
    diagnostics::ErrorListener,
    metadata::{tablestream::columns, CodedIndex, DotNetDirectoryFlags, Metadata, TableIndex},
    pe::PeFile,
    segment::{Segment, SegmentRef, ZeroesSegment},
    Result,
};

const FIELD_SIGNATURE: u8 = 0x06;

mod element {
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const PTR: u8 = 0x0F;
    pub const VALUE_TYPE: u8 = 0x11;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FN_PTR: u8 = 0x1B;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
}

/// Locates the initialization data of `FieldRVA` rows.
pub trait FieldRvaDataReader: Send + Sync {
    /// Returns the data of `FieldRVA` row `rid` as stored in `file`, or `None` if it cannot be
    /// determined. Problems are reported to `listener`.
    ///
    /// # Errors
    /// Returns whatever `listener` escalates.
    fn read_field_data(
        &self,
        file: &PeFile,
        metadata: &Metadata,
        flags: DotNetDirectoryFlags,
        rid: u32,
        listener: &dyn ErrorListener,
    ) -> Result<Option<SegmentRef>>;
}

/// Sizes the data from the field signature and reads it from the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFieldRvaDataReader;

/// The type of a field as far as its data layout is concerned.
enum FieldType {
    Element(u8),
    /// A value type defined in this module, by `TypeDef` rid.
    ValueType(u32),
    Unknown,
}

fn field_type(metadata: &Metadata, field_rid: u32) -> Result<FieldType> {
    let (Some(tables), Some(blobs)) = (metadata.tables()?, metadata.blobs()?) else {
        return Ok(FieldType::Unknown);
    };

    let signature = tables.read_column(TableIndex::Field, field_rid, columns::FIELD_SIGNATURE)?;
    let mut reader = blobs.reader(signature)?;
    if reader.read_u8()? != FIELD_SIGNATURE {
        return Ok(FieldType::Unknown);
    }

    loop {
        match reader.read_u8()? {
            element::CMOD_REQD | element::CMOD_OPT => {
                reader.read_compressed_u32()?;
            }
            element::VALUE_TYPE => {
                let token = CodedIndex::TypeDefOrRef.decode(reader.read_compressed_u32()?)?;
                return Ok(if token.table_index() == Some(TableIndex::TypeDef) {
                    FieldType::ValueType(token.rid())
                } else {
                    FieldType::Unknown
                });
            }
            other => return Ok(FieldType::Element(other)),
        }
    }
}

impl DefaultFieldRvaDataReader {
    /// Size in bytes of the field `field_rid` when loaded with the given pointer width.
    ///
    /// Returns 0 for types whose size cannot be derived.
    ///
    /// # Errors
    /// Returns an error if the signature blob or a `ClassLayout` row cannot be read.
    pub fn field_size(metadata: &Metadata, field_rid: u32, is_32bit: bool) -> Result<u32> {
        let size = match field_type(metadata, field_rid)? {
            FieldType::Element(element::BOOLEAN | element::I1 | element::U1) => 1,
            FieldType::Element(element::CHAR | element::I2 | element::U2) => 2,
            FieldType::Element(element::I4 | element::U4 | element::R4) => 4,
            FieldType::Element(element::I8 | element::U8 | element::R8) => 8,
            FieldType::Element(element::I | element::U | element::PTR | element::FN_PTR) => {
                if is_32bit {
                    4
                } else {
                    8
                }
            }
            FieldType::ValueType(type_rid) => class_layout_column(
                metadata,
                type_rid,
                columns::CLASS_LAYOUT_CLASS_SIZE,
            )?
            .unwrap_or(0),
            FieldType::Element(_) | FieldType::Unknown => 0,
        };
        Ok(size)
    }

    /// The `PackingSize` of the value type of field `field_rid`, if it declares one.
    ///
    /// # Errors
    /// Returns an error if the signature blob or a `ClassLayout` row cannot be read.
    pub fn field_alignment(metadata: &Metadata, field_rid: u32) -> Result<Option<u32>> {
        match field_type(metadata, field_rid)? {
            FieldType::ValueType(type_rid) => Ok(class_layout_column(
                metadata,
                type_rid,
                columns::CLASS_LAYOUT_PACKING_SIZE,
            )?
            .filter(|packing| *packing != 0)),
            _ => Ok(None),
        }
    }
}

fn class_layout_column(metadata: &Metadata, type_rid: u32, column: usize) -> Result<Option<u32>> {
    let Some(tables) = metadata.tables()? else {
        return Ok(None);
    };
    match tables.find_row(TableIndex::ClassLayout, columns::CLASS_LAYOUT_PARENT, type_rid)? {
        Some(layout) => Ok(Some(tables.read_column(TableIndex::ClassLayout, layout, column)?)),
        None => Ok(None),
    }
}

impl FieldRvaDataReader for DefaultFieldRvaDataReader {
    fn read_field_data(
        &self,
        file: &PeFile,
        metadata: &Metadata,
        flags: DotNetDirectoryFlags,
        rid: u32,
        listener: &dyn ErrorListener,
    ) -> Result<Option<SegmentRef>> {
        let Some(tables) = metadata.tables()? else {
            return Ok(None);
        };

        let rva = tables.read_column(TableIndex::FieldRva, rid, columns::FIELD_RVA_RVA)?;
        let field = tables.read_column(TableIndex::FieldRva, rid, columns::FIELD_RVA_FIELD)?;
        if rva == 0 {
            return Ok(None);
        }

        let is_32bit = flags.is_loaded_as_32bit(file.is_32bit());
        let size = Self::field_size(metadata, field, is_32bit)?;
        if size == 0 {
            listener.report_not_supported(&format!(
                "Could not determine the size of the data of field {field} (FieldRVA row {rid})"
            ))?;
            return Ok(None);
        }

        let Some(section) = file.try_get_section_containing_rva(rva) else {
            listener.bad_image(&format!("Field data RVA 0x{rva:08X} is not mapped"))?;
            return Ok(None);
        };

        if rva - section.rva() >= section.physical_size() {
            return Ok(Some(Arc::new(ZeroesSegment::new(size))));
        }

        match file
            .create_reader_at_rva_sized(rva, size)
            .and_then(|mut reader| reader.read_segment(size))
        {
            Ok(segment) => Ok(Some(Arc::new(segment))),
            Err(error) => {
                listener.bad_image(&format!("Invalid field data at RVA 0x{rva:08X}: {error}"))?;
                Ok(None)
            }
        }
    }
}
