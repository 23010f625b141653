//! End-to-end rebuilds through the file system, cross-checked with an independent PE parser.

mod common;

use std::io::Write;

use common::{dotnet_file, read_at, FAT_BODY, FIELD_DATA, TINY_BODY};
use goblin::pe::PE;
use peweave::{
    metadata::tablestream::columns,
    pe::compute_checksum,
    prelude::*,
};

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut temp = tempfile::NamedTempFile::new().unwrap();
    temp.write_all(bytes).unwrap();
    temp.flush().unwrap();
    temp
}

fn method_rva(image: &PeImage, rid: u32) -> u32 {
    let dotnet = image.dotnet().unwrap().unwrap();
    let tables = dotnet.metadata.as_ref().unwrap().tables().unwrap().unwrap();
    tables
        .read_column(TableIndex::MethodDef, rid, columns::METHOD_DEF_RVA)
        .unwrap()
}

fn field_rva(image: &PeImage) -> u32 {
    let dotnet = image.dotnet().unwrap().unwrap();
    let tables = dotnet.metadata.as_ref().unwrap().tables().unwrap().unwrap();
    tables
        .read_column(TableIndex::FieldRva, 1, columns::FIELD_RVA_RVA)
        .unwrap()
}

#[test]
fn managed_i386_rebuild_is_loadable() -> Result<()> {
    let source = write_temp(&dotnet_file(MachineType::I386).to_bytes()?);
    let image = PeImage::from_path(source.path())?;

    let bytes = PeFileBuilder::managed().create_file(&image)?.to_bytes()?;
    let output = write_temp(&bytes);
    let rebuilt = PeImage::from_path(output.path())?;
    let file = rebuilt.file().unwrap();

    assert_eq!(read_at(file, method_rva(&rebuilt, 1), TINY_BODY.len()), TINY_BODY);
    assert_eq!(read_at(file, method_rva(&rebuilt, 2), FAT_BODY.len()), FAT_BODY);
    assert_eq!(read_at(file, field_rva(&rebuilt), FIELD_DATA.len()), FIELD_DATA);

    let pe = PE::parse(&bytes).unwrap();
    assert!(!pe.is_64);
    let names: Vec<&str> = pe.sections.iter().map(|s| s.name().unwrap()).collect();
    assert_eq!(names, vec![".text", ".reloc"]);
    assert_eq!(pe.entry as u32, file.optional_header.address_of_entry_point);
    assert_ne!(pe.entry, 0);

    assert_eq!(pe.libraries, vec!["mscoree.dll"]);
    assert_eq!(pe.imports.len(), 1);
    assert_eq!(pe.imports[0].name, "_CorExeMain");

    let clr = pe
        .header
        .optional_header
        .as_ref()
        .unwrap()
        .data_directories
        .get_clr_runtime_header()
        .copied()
        .unwrap();
    assert_eq!(clr.size, 72);
    assert_eq!(
        read_at(file, clr.virtual_address, 4),
        72u32.to_le_bytes().to_vec()
    );
    Ok(())
}

#[test]
fn managed_amd64_rebuild_has_no_imports() -> Result<()> {
    let image = PeImage::from_bytes(dotnet_file(MachineType::Amd64).to_bytes()?)?;
    let bytes = PeFileBuilder::managed().create_file(&image)?.to_bytes()?;

    let pe = PE::parse(&bytes).unwrap();
    assert!(pe.is_64);
    assert_eq!(pe.entry, 0);
    assert!(pe.imports.is_empty());
    assert_eq!(pe.sections.len(), 1);

    let rebuilt = PeImage::from_bytes(bytes)?;
    let dotnet = rebuilt.dotnet()?.unwrap();
    assert!(dotnet.is_il_only());
    assert_eq!(dotnet.entry_point, Token::from_parts(TableIndex::MethodDef, 1).value());
    Ok(())
}

#[test]
fn rebuilt_image_rebuilds_identically() -> Result<()> {
    let image = PeImage::from_bytes(dotnet_file(MachineType::I386).to_bytes()?)?;
    let first = PeFileBuilder::managed().create_file(&image)?.to_bytes()?;

    let again = PeImage::from_bytes(first.clone())?;
    let second = PeFileBuilder::managed().create_file(&again)?.to_bytes()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn unmanaged_rebuild_keeps_layout() -> Result<()> {
    let mut original = dotnet_file(MachineType::Amd64);
    let image = PeImage::from_bytes(original.to_bytes()?)?;
    let original_tiny = method_rva(&image, 1);

    let bytes = PeFileBuilder::unmanaged().create_file(&image)?.to_bytes()?;
    let pe = PE::parse(&bytes).unwrap();
    assert_eq!(pe.sections[0].name().unwrap(), ".text");
    assert_eq!(pe.sections[0].virtual_address, common::SECTION_RVA);

    let rebuilt = PeImage::from_bytes(bytes)?;
    assert_eq!(method_rva(&rebuilt, 1), original_tiny);
    assert_eq!(
        read_at(rebuilt.file().unwrap(), original_tiny, TINY_BODY.len()),
        TINY_BODY
    );
    Ok(())
}

#[test]
fn checksum_matches_file_contents() -> Result<()> {
    let image = PeImage::from_bytes(dotnet_file(MachineType::I386).to_bytes()?)?;
    let config = BuilderConfig {
        compute_checksum: true,
        ..BuilderConfig::default()
    };
    let mut file = PeFileBuilder::managed()
        .with_config(config)
        .create_file(&image)?;
    let bytes = file.to_bytes()?;
    let offset = usize::try_from(file.checksum_offset()).unwrap();

    let pe = PE::parse(&bytes).unwrap();
    let stored = pe.header.optional_header.as_ref().unwrap().windows_fields.check_sum;
    assert_ne!(stored, 0);
    assert_eq!(stored, compute_checksum(&bytes, offset));
    Ok(())
}

#[test]
fn shared_image_rebuilds_concurrently() -> Result<()> {
    use rayon::prelude::*;

    let image = PeImage::from_bytes(dotnet_file(MachineType::I386).to_bytes()?)?;
    let outputs: Vec<Vec<u8>> = (0..8)
        .into_par_iter()
        .map(|_| {
            PeFileBuilder::managed()
                .create_file(&image)
                .and_then(|mut file| file.to_bytes())
        })
        .collect::<Result<_>>()?;

    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}
