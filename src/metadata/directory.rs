use std::{fmt, sync::Arc};

use super::{
    heaps::{
        BlobHeap, GuidHeap, StringsHeap, UserStringsHeap, BLOB_STREAM_NAME, GUID_STREAM_NAME,
        STRINGS_STREAM_NAME, USER_STRINGS_STREAM_NAME,
    },
    root::{MetadataRoot, StreamHeader},
    tablestream::{TablesStream, COMPRESSED_STREAM_NAME, ENC_STREAM_NAME, MINIMAL_STREAM_NAME},
};
use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    lazy::LazyVariable,
    segment::{ReaderSegment, SegmentRef},
    utils::{align_up_u32, to_u32},
    Result,
};

/// A metadata directory: the `BSJB` root and lazily parsed streams.
///
/// The raw bytes are kept as read, so the directory can be written back unchanged while the
/// builder patches individual table columns on top of it.
pub struct Metadata {
    root: MetadataRoot,
    reader: BinaryStreamReader,
    tables: LazyVariable<Option<TablesStream>>,
    strings: LazyVariable<Option<StringsHeap>>,
    user_strings: LazyVariable<Option<UserStringsHeap>>,
    blobs: LazyVariable<Option<BlobHeap>>,
    guids: LazyVariable<Option<GuidHeap>>,
}

fn stream_reader(
    reader: &BinaryStreamReader,
    header: Option<&StreamHeader>,
) -> Result<Option<BinaryStreamReader>> {
    header
        .map(|header| reader.fork_relative_sized(u64::from(header.offset), header.size))
        .transpose()
}

impl Metadata {
    /// Reads the root of the metadata directory covered by `reader`. Streams are parsed on
    /// first access.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the root is invalid.
    pub fn from_reader(reader: BinaryStreamReader) -> Result<Self> {
        let root = MetadataRoot::from_reader(&mut reader.fork())?;
        tracing::debug!(
            version = %root.version,
            streams = root.streams.len(),
            "read metadata root"
        );

        let tables = {
            let reader = reader.clone();
            let root = root.clone();
            LazyVariable::with_factory(move || {
                let header = root
                    .streams
                    .iter()
                    .rev()
                    .find(|s| s.name == COMPRESSED_STREAM_NAME || s.name == ENC_STREAM_NAME);
                let force_large = root.stream(MINIMAL_STREAM_NAME).is_some();
                match (header, stream_reader(&reader, header)?) {
                    (Some(header), Some(stream)) => Ok(Some(TablesStream::from_reader(
                        header.name.clone(),
                        stream,
                        force_large,
                    )?)),
                    _ => Ok(None),
                }
            })
        };

        macro_rules! lazy_heap {
            ($name:expr, $heap:ident) => {{
                let reader = reader.clone();
                let header = root.stream($name).cloned();
                LazyVariable::with_factory(move || {
                    Ok(stream_reader(&reader, header.as_ref())?.map($heap::new))
                })
            }};
        }

        Ok(Metadata {
            strings: lazy_heap!(STRINGS_STREAM_NAME, StringsHeap),
            user_strings: lazy_heap!(USER_STRINGS_STREAM_NAME, UserStringsHeap),
            blobs: lazy_heap!(BLOB_STREAM_NAME, BlobHeap),
            guids: lazy_heap!(GUID_STREAM_NAME, GuidHeap),
            root,
            reader,
            tables,
        })
    }

    /// Reads a metadata directory from a buffer.
    ///
    /// # Errors
    /// See [`Metadata::from_reader`].
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_reader(BinaryStreamReader::from_bytes(data))
    }

    /// The metadata root.
    #[must_use]
    pub fn root(&self) -> &MetadataRoot {
        &self.root
    }

    /// Reader over the whole directory.
    #[must_use]
    pub fn reader(&self) -> &BinaryStreamReader {
        &self.reader
    }

    /// Size of the directory in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.reader.length()
    }

    /// A reader over the stream named `name`.
    ///
    /// # Errors
    /// Returns an error if the stream lies outside the directory.
    pub fn stream(&self, name: &str) -> Result<Option<BinaryStreamReader>> {
        stream_reader(&self.reader, self.root.stream(name))
    }

    /// The tables stream (`#~` or `#-`).
    ///
    /// # Errors
    /// Returns an error if the stream header is malformed.
    pub fn tables(&self) -> Result<Option<&TablesStream>> {
        Ok(self.tables.get()?.as_ref())
    }

    /// The `#Strings` heap.
    ///
    /// # Errors
    /// Returns an error if the stream lies outside the directory.
    pub fn strings(&self) -> Result<Option<&StringsHeap>> {
        Ok(self.strings.get()?.as_ref())
    }

    /// The `#US` heap.
    ///
    /// # Errors
    /// Returns an error if the stream lies outside the directory.
    pub fn user_strings(&self) -> Result<Option<&UserStringsHeap>> {
        Ok(self.user_strings.get()?.as_ref())
    }

    /// The `#Blob` heap.
    ///
    /// # Errors
    /// Returns an error if the stream lies outside the directory.
    pub fn blobs(&self) -> Result<Option<&BlobHeap>> {
        Ok(self.blobs.get()?.as_ref())
    }

    /// The `#GUID` heap.
    ///
    /// # Errors
    /// Returns an error if the stream lies outside the directory.
    pub fn guids(&self) -> Result<Option<&GuidHeap>> {
        Ok(self.guids.get()?.as_ref())
    }

    /// A segment over the raw directory bytes.
    #[must_use]
    pub fn to_segment(&self) -> SegmentRef {
        Arc::new(ReaderSegment::new(self.reader.clone()))
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("version", &self.root.version)
            .field("streams", &self.root.streams)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Assembles a metadata directory from stream contents.
#[derive(Debug, Clone, Default)]
pub struct MetadataBuilder {
    /// Runtime version string.
    pub version: Option<String>,
    streams: Vec<(String, Vec<u8>)>,
}

impl MetadataBuilder {
    /// Creates a builder with the default version string.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stream.
    #[must_use]
    pub fn with_stream(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.streams.push((name.into(), data));
        self
    }

    /// Serializes the root followed by the streams, each aligned to 4 bytes.
    ///
    /// # Errors
    /// Returns an error if the directory exceeds 4 GiB.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut root = MetadataRoot::default();
        if let Some(version) = self.version {
            root.version = version;
        }
        root.streams = self
            .streams
            .iter()
            .map(|(name, _)| StreamHeader::new(name.clone(), 0, 0))
            .collect();

        let mut offset = root.size();
        for (header, (_, data)) in root.streams.iter_mut().zip(&self.streams) {
            header.offset = offset;
            header.size = align_up_u32(to_u32(data.len())?, 4);
            offset += header.size;
        }

        let mut writer = MemoryStreamWriter::new();
        root.write(&mut writer)?;
        for (header, (_, data)) in root.streams.iter().zip(&self.streams) {
            writer.write_bytes(data)?;
            writer.write_zeroes(u64::from(header.size) - data.len() as u64)?;
        }
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        heaps::{StringsHeapBuilder, UserStringsHeapBuilder},
        tablestream::{columns, TablesStreamBuilder},
        TableIndex,
    };
    use crate::segment::Segment;
    use widestring::U16String;

    fn sample() -> Metadata {
        let mut strings = StringsHeapBuilder::new();
        let name = strings.add("Main").unwrap();
        let mut user_strings = UserStringsHeapBuilder::new();
        user_strings.add(&U16String::from_str("Hello")).unwrap();

        let mut tables = TablesStreamBuilder::new();
        tables
            .add_row(TableIndex::MethodDef, vec![0x2050, 0, 0x96, name, 0, 1])
            .unwrap();

        let data = MetadataBuilder::new()
            .with_stream("#~", tables.build().unwrap())
            .with_stream("#Strings", strings.build())
            .with_stream("#US", user_strings.build().unwrap())
            .build()
            .unwrap();
        Metadata::from_bytes(data).unwrap()
    }

    #[test]
    fn streams_are_resolved() {
        let metadata = sample();
        assert_eq!(metadata.root().streams.len(), 3);

        let tables = metadata.tables().unwrap().unwrap();
        assert_eq!(tables.name(), "#~");
        let name = tables
            .read_column(TableIndex::MethodDef, 1, 3)
            .unwrap();
        assert_eq!(metadata.strings().unwrap().unwrap().get(name).unwrap(), "Main");
        assert_eq!(
            tables
                .read_column(TableIndex::MethodDef, 1, columns::METHOD_DEF_RVA)
                .unwrap(),
            0x2050
        );

        assert_eq!(
            metadata
                .user_strings()
                .unwrap()
                .unwrap()
                .get(1)
                .unwrap()
                .to_string_lossy(),
            "Hello"
        );
        assert!(metadata.blobs().unwrap().is_none());
    }

    #[test]
    fn raw_bytes_are_preserved() {
        let metadata = sample();
        let bytes = metadata.reader().fork().read_to_end();
        let segment = metadata.to_segment();
        assert_eq!(segment.physical_size(), metadata.size());
        assert_eq!(segment.to_bytes().unwrap(), bytes);
    }
}
