//! Building a native library from an image that was never read from disk.

use std::sync::Arc;

use goblin::pe::PE;
use peweave::{
    image::{ExportAddress, RelocationType, ResourceData, ResourceIdentifier},
    pe::Characteristics,
    prelude::*,
    segment::SegmentReference,
};

/// `mov eax, 42; ret`
const ANSWER: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

fn sample_library() -> Result<(PeImage, SegmentRef)> {
    let mut image = PeImage::new(MachineType::Amd64);
    image.characteristics |= Characteristics::DLL;

    let code: SegmentRef = Arc::new(DataSegment::new(ANSWER.to_vec()));
    let slot: SegmentRef = Arc::new(DataSegment::new(vec![0; 8]));

    let mut exports = ExportDirectory::new("answer.dll");
    exports.entries.push(ExportedSymbol::new(
        "Answer",
        ExportAddress::Segment(SegmentReference::new(Arc::clone(&code))),
    ));
    exports.entries.push(ExportedSymbol::new(
        "Slot",
        ExportAddress::Segment(SegmentReference::new(Arc::clone(&slot))),
    ));
    *image.exports_mut()? = Some(exports);

    image.relocations_mut()?.push(BaseRelocation::new(
        RelocationType::Dir64,
        Arc::new(SegmentReference::new(Arc::clone(&slot))),
    ));

    let mut language = ResourceDirectory::new(ResourceIdentifier::Id(1));
    language.entries.push(ResourceEntry::Data(ResourceData {
        identifier: ResourceIdentifier::Id(1033),
        contents: Arc::new(DataSegment::new(b"hello".to_vec())),
        code_page: 0,
    }));
    let mut kind = ResourceDirectory::new(ResourceIdentifier::Id(16));
    kind.entries.push(ResourceEntry::Directory(language));
    let mut root = ResourceDirectory::new(ResourceIdentifier::Id(0));
    root.entries.push(ResourceEntry::Directory(kind));
    *image.resources_mut()? = Some(root);

    Ok((image, slot))
}

#[test]
fn library_from_scratch() -> Result<()> {
    let (image, slot) = sample_library()?;
    let mut file = PeFileBuilder::unmanaged().create_file(&image)?;
    let bytes = file.to_bytes()?;

    let names: Vec<&str> = file.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![".auxtext", ".sdata", ".auxrsrc", ".reloc"]);
    assert_eq!(file.optional_header.address_of_entry_point, 0);

    let pe = PE::parse(&bytes).unwrap();
    assert!(pe.is_64);
    assert!(pe.is_lib);
    let answer = pe
        .exports
        .iter()
        .find(|export| export.name == Some("Answer"))
        .unwrap();
    let slot_export = pe
        .exports
        .iter()
        .find(|export| export.name == Some("Slot"))
        .unwrap();
    assert_eq!(slot_export.rva as u32, slot.rva());

    let rebuilt = PeImage::from_bytes(bytes.clone())?;
    let exports = rebuilt.exports()?.unwrap();
    assert_eq!(exports.name, "answer.dll");
    assert_eq!(
        exports.entry("Answer").unwrap().address.rva(),
        answer.rva as u32
    );

    let mut reader = rebuilt.file().unwrap().create_reader_at_rva(answer.rva as u32)?;
    let mut code = [0u8; ANSWER.len()];
    assert_eq!(reader.read_bytes(&mut code), ANSWER.len());
    assert_eq!(code, ANSWER);

    let relocations = rebuilt.relocations()?;
    assert_eq!(relocations.len(), 1);
    assert_eq!(relocations[0].kind, RelocationType::Dir64);
    assert_eq!(relocations[0].location.rva(), slot.rva());

    let root = rebuilt.resources()?.unwrap();
    assert_eq!(root.data_count(), 1);
    let Some(ResourceEntry::Directory(kind)) = root.entry(&ResourceIdentifier::Id(16)) else {
        panic!("missing resource type");
    };
    let Some(ResourceEntry::Directory(language)) = kind.entry(&ResourceIdentifier::Id(1)) else {
        panic!("missing resource name");
    };
    let Some(ResourceEntry::Data(data)) = language.entry(&ResourceIdentifier::Id(1033)) else {
        panic!("missing resource data");
    };
    assert_eq!(data.contents.to_bytes()?, b"hello".to_vec());
    Ok(())
}

#[test]
fn empty_native_image_builds() {
    let image = PeImage::new(MachineType::I386);
    let mut file = PeFileBuilder::unmanaged().create_file(&image).unwrap();
    assert!(file.sections.is_empty());
    assert!(file.to_bytes().is_ok());
}

#[test]
fn managed_build_requires_clr_data() {
    let image = PeImage::new(MachineType::I386);
    assert!(matches!(
        PeFileBuilder::managed().create_file(&image),
        Err(Error::Malformed { .. })
    ));
}
