//! The CLR data of a rebuilt image: COR20 header, method bodies, field initialization data,
//! metadata and the blobs the header points at.
//!
//! The metadata directory is copied verbatim. `MethodDef.RVA` and `FieldRVA.RVA` columns of
//! moved bodies and data are patched with their new RVAs when the metadata is written.

use std::{collections::HashMap, sync::Arc};

use crate::{
    cil::CilRawMethodBody,
    diagnostics::ErrorListener,
    image::{DefaultFieldRvaDataReader, DotNetDirectory, FieldRvaDataReader, MethodImplAttributes},
    io::BinaryStreamWriter,
    metadata::{
        tablestream::{columns, COMPRESSED_STREAM_NAME, ENC_STREAM_NAME},
        Cor20Header, Metadata, TableIndex,
    },
    pe::PeFile,
    segment::{
        AddressFixupKind, Patch, PatchedSegment, RelocationParameters, Segment, SegmentBuilder,
        SegmentOffsets, SegmentRef, SegmentReference,
    },
    Result,
};

/// Alignment of CIL bodies with a fat header.
const FAT_METHOD_BODY_ALIGNMENT: u32 = 4;
/// Alignment of field data without an explicit packing size.
const FIELD_DATA_ALIGNMENT: u32 = 4;
/// Alignment of the blobs following the COR20 header.
const DIRECTORY_ALIGNMENT: u32 = 4;

/// A method body placed by the builder.
#[derive(Clone)]
pub struct PlacedMethodBody {
    /// `MethodDef` rid.
    pub rid: u32,
    /// The body.
    pub body: SegmentRef,
    /// Required alignment of the body.
    pub alignment: u32,
}

/// Field initialization data placed by the builder.
#[derive(Clone)]
pub struct PlacedFieldData {
    /// `FieldRVA` rid.
    pub rid: u32,
    /// The data.
    pub data: SegmentRef,
    /// Required alignment of the data.
    pub alignment: u32,
}

/// Collects the bodies of the `MethodDef` rows.
///
/// Replacements from [`DotNetDirectory::method_bodies`] always win. With `replacements_only`
/// unset, CIL bodies of the remaining rows are read from `file`; rows sharing an RVA share the
/// body. Native bodies cannot be moved and are reported to `listener`.
///
/// Tiny CIL bodies are unaligned, fat ones 4-byte aligned and native replacements aligned to
/// `pointer_size`.
///
/// # Errors
/// Returns whatever `listener` escalates, or an error if the tables cannot be read.
pub fn collect_method_bodies(
    file: Option<&PeFile>,
    directory: &DotNetDirectory,
    pointer_size: u32,
    replacements_only: bool,
    listener: &dyn ErrorListener,
) -> Result<Vec<PlacedMethodBody>> {
    let Some(tables) = directory.metadata.as_deref().map(Metadata::tables).transpose()?.flatten() else {
        return Ok(Vec::new());
    };

    let mut by_rva: HashMap<u32, (SegmentRef, u32)> = HashMap::new();
    let mut bodies = Vec::new();
    for rid in 1..=tables.row_count(TableIndex::MethodDef) {
        #[allow(clippy::cast_possible_truncation)]
        let impl_flags = MethodImplAttributes::from_bits_retain(
            tables.read_column(TableIndex::MethodDef, rid, columns::METHOD_DEF_IMPL_FLAGS)? as u16,
        );

        if let Some(body) = directory.method_bodies.get(&rid) {
            bodies.push(PlacedMethodBody {
                rid,
                body: Arc::clone(body),
                alignment: if impl_flags.is_il() {
                    FAT_METHOD_BODY_ALIGNMENT
                } else {
                    pointer_size
                },
            });
            continue;
        }
        if replacements_only {
            continue;
        }

        let rva = tables.read_column(TableIndex::MethodDef, rid, columns::METHOD_DEF_RVA)?;
        if rva == 0 {
            continue;
        }
        if let Some((body, alignment)) = by_rva.get(&rva) {
            bodies.push(PlacedMethodBody {
                rid,
                body: Arc::clone(body),
                alignment: *alignment,
            });
            continue;
        }

        if !impl_flags.is_il() {
            listener.report_not_supported(&format!(
                "Method {rid} has a native body at RVA 0x{rva:08X} that cannot be relocated"
            ))?;
            continue;
        }

        let Some(file) = file else {
            listener.report_not_supported(&format!(
                "Method {rid} references RVA 0x{rva:08X} without a body to place there"
            ))?;
            continue;
        };

        match file
            .create_reader_at_rva(rva)
            .and_then(|mut reader| CilRawMethodBody::from_reader(&mut reader))
        {
            Ok(body) => {
                let alignment = if body.is_fat() { FAT_METHOD_BODY_ALIGNMENT } else { 1 };
                let body: SegmentRef = Arc::new(body);
                by_rva.insert(rva, (Arc::clone(&body), alignment));
                bodies.push(PlacedMethodBody {
                    rid,
                    body,
                    alignment,
                });
            }
            Err(error) => {
                listener.bad_image(&format!("Invalid body of method {rid} at RVA 0x{rva:08X}: {error}"))?;
            }
        }
    }

    tracing::debug!(count = bodies.len(), "collected method bodies");
    Ok(bodies)
}

/// Collects the initialization data of the `FieldRVA` rows.
///
/// Replacements from [`DotNetDirectory::field_data`] always win; with `replacements_only`
/// unset, the remaining rows are resolved with `reader`.
///
/// # Errors
/// Returns whatever `listener` escalates, or an error if the tables cannot be read.
pub fn collect_field_data(
    file: Option<&PeFile>,
    directory: &DotNetDirectory,
    reader: &dyn FieldRvaDataReader,
    replacements_only: bool,
    listener: &dyn ErrorListener,
) -> Result<Vec<PlacedFieldData>> {
    let Some(metadata) = directory.metadata.as_deref() else {
        return Ok(Vec::new());
    };
    let Some(tables) = metadata.tables()? else {
        return Ok(Vec::new());
    };

    let mut fields = Vec::new();
    for rid in 1..=tables.row_count(TableIndex::FieldRva) {
        let data = match directory.field_data.get(&rid) {
            Some(data) => Arc::clone(data),
            None if replacements_only => continue,
            None => {
                let Some(file) = file else {
                    continue;
                };
                match reader.read_field_data(file, metadata, directory.flags, rid, listener)? {
                    Some(data) => data,
                    None => continue,
                }
            }
        };

        let field = tables.read_column(TableIndex::FieldRva, rid, columns::FIELD_RVA_FIELD)?;
        let alignment = DefaultFieldRvaDataReader::field_alignment(metadata, field)?
            .unwrap_or(FIELD_DATA_ALIGNMENT);
        fields.push(PlacedFieldData {
            rid,
            data,
            alignment,
        });
    }

    tracing::debug!(count = fields.len(), "collected field data");
    Ok(fields)
}

/// Writes the COR20 header with the final locations of the segments it points at.
struct Cor20HeaderSegment {
    directory: DotNetDirectory,
    metadata: Option<SegmentRef>,
    offsets: SegmentOffsets,
}

impl Segment for Cor20HeaderSegment {
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
        Cor20Header::SIZE
    }

    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        self.directory.create_header(self.metadata.as_ref()).write(writer)
    }
}

/// The CLR data of an image, split into the COR20 header and everything it points at.
pub struct DotNetSegmentBuffer {
    header: SegmentRef,
    contents: Arc<SegmentBuilder>,
    metadata: Option<SegmentRef>,
}

impl DotNetSegmentBuffer {
    /// Lays out `directory` with the given bodies and field data.
    ///
    /// The VTable fixups are not part of the buffer; they belong in a writable section.
    ///
    /// # Errors
    /// Returns an error if the tables stream cannot be read.
    pub fn new(
        directory: &DotNetDirectory,
        bodies: &[PlacedMethodBody],
        fields: &[PlacedFieldData],
    ) -> Result<Self> {
        let mut contents = SegmentBuilder::new();

        let mut field_table = SegmentBuilder::new();
        for field in fields {
            field_table.add(Arc::clone(&field.data), field.alignment);
        }
        contents.add(Arc::new(field_table), DIRECTORY_ALIGNMENT);

        let mut body_table = SegmentBuilder::new();
        let mut placed: Vec<&SegmentRef> = Vec::new();
        for body in bodies {
            if !placed.iter().any(|other| Arc::ptr_eq(other, &body.body)) {
                placed.push(&body.body);
                body_table.add(Arc::clone(&body.body), body.alignment);
            }
        }
        contents.add(Arc::new(body_table), DIRECTORY_ALIGNMENT);

        let metadata = match directory.metadata.as_deref() {
            Some(metadata) => {
                let segment = patch_metadata(metadata, bodies, fields)?;
                contents.add(Arc::clone(&segment), DIRECTORY_ALIGNMENT);
                Some(segment)
            }
            None => None,
        };

        for blob in [
            &directory.resources,
            &directory.strong_name,
            &directory.code_manager_table,
            &directory.export_address_table,
            &directory.managed_native_header,
        ]
        .into_iter()
        .flatten()
        {
            contents.add(Arc::clone(blob), DIRECTORY_ALIGNMENT);
        }

        let header = Arc::new(Cor20HeaderSegment {
            directory: directory.clone(),
            metadata: metadata.clone(),
            offsets: SegmentOffsets::default(),
        });

        Ok(DotNetSegmentBuffer {
            header,
            contents: Arc::new(contents),
            metadata,
        })
    }

    /// The COR20 header.
    #[must_use]
    pub fn header(&self) -> SegmentRef {
        Arc::clone(&self.header)
    }

    /// Field data, method bodies, metadata and the remaining CLR blobs.
    #[must_use]
    pub fn contents(&self) -> SegmentRef {
        self.contents.clone()
    }

    /// The patched metadata directory.
    #[must_use]
    pub fn metadata(&self) -> Option<&SegmentRef> {
        self.metadata.as_ref()
    }
}

/// A copy of `metadata` whose RVA columns point at the placed bodies and data.
fn patch_metadata(
    metadata: &Metadata,
    bodies: &[PlacedMethodBody],
    fields: &[PlacedFieldData],
) -> Result<SegmentRef> {
    let mut segment = PatchedSegment::new(metadata.to_segment());

    let stream = metadata
        .root()
        .stream(COMPRESSED_STREAM_NAME)
        .or_else(|| metadata.root().stream(ENC_STREAM_NAME));
    if let (Some(stream), Some(tables)) = (stream, metadata.tables()?) {
        for body in bodies {
            let column = tables.column_offset(TableIndex::MethodDef, body.rid, columns::METHOD_DEF_RVA)?;
            segment.add(Patch::AddressFixup {
                relative_offset: stream.offset + column,
                kind: AddressFixupKind::Rva32,
                symbol: Arc::new(SegmentReference::new(Arc::clone(&body.body))),
            });
        }
        for field in fields {
            let column = tables.column_offset(TableIndex::FieldRva, field.rid, columns::FIELD_RVA_RVA)?;
            segment.add(Patch::AddressFixup {
                relative_offset: stream.offset + column,
                kind: AddressFixupKind::Rva32,
                symbol: Arc::new(SegmentReference::new(Arc::clone(&field.data))),
            });
        }
    }

    Ok(Arc::new(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::{DiagnosticsErrorListener, ThrowErrorListener},
        image::read_dotnet_directory,
        segment::DataSegment,
        test::factories::image::{build_dotnet_file, layout, DotNetFileOptions, FAT_BODY, SECTION_RVA, TINY_BODY},
    };

    #[test]
    fn reads_il_bodies_from_file() {
        let file = build_dotnet_file(&DotNetFileOptions::default());
        let directory = read_dotnet_directory(&file, &ThrowErrorListener).unwrap().unwrap();

        let bodies = collect_method_bodies(Some(&file), &directory, 4, false, &ThrowErrorListener).unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].body.to_bytes().unwrap(), TINY_BODY);
        assert_eq!(bodies[1].body.to_bytes().unwrap(), FAT_BODY);
        assert_eq!(bodies[0].body.rva(), SECTION_RVA + layout::TINY_BODY);
    }

    #[test]
    fn native_bodies_are_reported() {
        let options = DotNetFileOptions {
            native_method: true,
            ..DotNetFileOptions::default()
        };
        let file = build_dotnet_file(&options);
        let directory = read_dotnet_directory(&file, &ThrowErrorListener).unwrap().unwrap();

        assert!(collect_method_bodies(Some(&file), &directory, 4, false, &ThrowErrorListener).is_err());

        let listener = DiagnosticsErrorListener::new();
        let bodies = collect_method_bodies(Some(&file), &directory, 4, false, &listener).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(listener.diagnostics().count(), 1);
    }

    #[test]
    fn replacements_only() {
        let file = build_dotnet_file(&DotNetFileOptions::default());
        let mut directory = read_dotnet_directory(&file, &ThrowErrorListener).unwrap().unwrap();
        let replacement: SegmentRef = Arc::new(DataSegment::new(vec![0x06, 0x2A]));
        directory.method_bodies.insert(2, Arc::clone(&replacement));

        let bodies = collect_method_bodies(Some(&file), &directory, 4, true, &ThrowErrorListener).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].rid, 2);
        assert!(Arc::ptr_eq(&bodies[0].body, &replacement));
    }

    #[test]
    fn metadata_columns_follow_placed_segments() {
        let file = build_dotnet_file(&DotNetFileOptions::default());
        let directory = read_dotnet_directory(&file, &ThrowErrorListener).unwrap().unwrap();
        let bodies = collect_method_bodies(Some(&file), &directory, 4, false, &ThrowErrorListener).unwrap();
        let fields = collect_field_data(
            Some(&file),
            &directory,
            &DefaultFieldRvaDataReader,
            false,
            &ThrowErrorListener,
        )
        .unwrap();
        assert_eq!(fields.len(), 3);

        let buffer = DotNetSegmentBuffer::new(&directory, &bodies, &fields).unwrap();
        buffer.header().update_offsets(&RelocationParameters::new(0x400, 0x4000));
        buffer
            .contents()
            .update_offsets(&RelocationParameters::new(0x448, 0x4048));

        let metadata = Metadata::from_bytes(buffer.metadata().unwrap().to_bytes().unwrap()).unwrap();
        let tables = metadata.tables().unwrap().unwrap();
        let rva = |table, rid, column| tables.read_column(table, rid, column).unwrap();

        assert_eq!(rva(TableIndex::MethodDef, 1, columns::METHOD_DEF_RVA), bodies[0].body.rva());
        assert_eq!(rva(TableIndex::MethodDef, 2, columns::METHOD_DEF_RVA), bodies[1].body.rva());
        assert_eq!(rva(TableIndex::FieldRva, 3, columns::FIELD_RVA_RVA), fields[2].data.rva());
        assert!(bodies[0].body.rva() >= 0x4048);
        assert_eq!(bodies[0].alignment, 1);
        assert_eq!(bodies[1].alignment, 4);
        assert_eq!(bodies[1].body.rva() % 4, 0);

        let header = buffer.header().to_bytes().unwrap();
        let header = Cor20Header::from_reader(&mut crate::io::BinaryStreamReader::from_bytes(header)).unwrap();
        assert_eq!(header.metadata.virtual_address, buffer.metadata().unwrap().rva());
        assert_eq!(header.entry_point, directory.entry_point);
    }
}
