//! Machine specific code emitted by the builders.
//!
//! A .NET image that needs the CLR bootstrapper gets a small native stub as its entry point.
//! The stub jumps through the import address table slot of `mscoree.dll!_CorExeMain` (or
//! `_CorDllMain`); its encoding and the relocations it needs depend on the target machine.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use strum::{Display, EnumIter};

use crate::{
    image::{BaseRelocation, RelocationType},
    io::{BinaryStreamReader, BinaryStreamWriter},
    pe::MachineType,
    segment::{
        AddressFixupKind, AddressReference, DataSegment, Patch, PatchedSegment,
        RelocationParameters, Segment, SegmentOffsets, SegmentRef, SegmentReference,
    },
    Result,
};

/// A code segment together with the base relocations it requires.
#[derive(Clone)]
pub struct ThunkStub {
    /// The stub code.
    pub segment: SegmentRef,
    /// Locations inside the stub that hold absolute addresses.
    pub relocations: Vec<BaseRelocation>,
}

impl fmt::Debug for ThunkStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkStub")
            .field("size", &self.segment.physical_size())
            .field("relocations", &self.relocations)
            .finish()
    }
}

/// A target machine supported by the builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Platform {
    /// x86.
    I386,
    /// x86-64.
    Amd64,
    /// AArch64.
    Arm64,
}

impl Platform {
    /// Selects the platform for `machine`, ignoring the .NET OS override bits.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for any other machine.
    pub fn get(machine: MachineType) -> Result<Self> {
        match machine.base_machine() {
            MachineType::I386 => Ok(Platform::I386),
            MachineType::Amd64 => Ok(Platform::Amd64),
            MachineType::Arm64 => Ok(Platform::Arm64),
            other => Err(not_supported_error!("Unsupported machine type {}", other)),
        }
    }

    /// The machine this platform targets.
    #[must_use]
    pub fn machine_type(self) -> MachineType {
        match self {
            Platform::I386 => MachineType::I386,
            Platform::Amd64 => MachineType::Amd64,
            Platform::Arm64 => MachineType::Arm64,
        }
    }

    /// Whether addresses are 32 bits wide.
    #[must_use]
    pub fn is_32bit(self) -> bool {
        self == Platform::I386
    }

    /// Size of an address in bytes.
    #[must_use]
    pub fn pointer_size(self) -> u32 {
        if self.is_32bit() {
            4
        } else {
            8
        }
    }

    /// Whether even IL-only images need a native entry point calling into `mscoree.dll`.
    #[must_use]
    pub fn is_clr_bootstrapper_required(self) -> bool {
        self == Platform::I386
    }

    /// Alignment of thunk stubs inside their section.
    #[must_use]
    pub fn thunk_stub_alignment(self) -> u32 {
        match self {
            Platform::I386 | Platform::Arm64 => 4,
            Platform::Amd64 => 8,
        }
    }

    /// Creates a stub that jumps to the address stored at `slot`.
    #[must_use]
    pub fn create_thunk_stub(self, slot: Arc<dyn AddressReference>) -> ThunkStub {
        match self {
            Platform::I386 => {
                // jmp dword [slot]
                let code = DataSegment::new(vec![0xFF, 0x25, 0, 0, 0, 0]);
                relocatable_stub(code, 2, AddressFixupKind::Absolute32, RelocationType::HighLow, slot)
            }
            Platform::Amd64 => {
                // mov rax, [slot]; jmp rax
                let code = DataSegment::new(vec![0x48, 0xA1, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xE0]);
                relocatable_stub(code, 2, AddressFixupKind::Absolute64, RelocationType::Dir64, slot)
            }
            Platform::Arm64 => ThunkStub {
                segment: Arc::new(Arm64ThunkStub::new(slot)),
                relocations: Vec::new(),
            },
        }
    }

    /// Decodes a stub created by [`Platform::create_thunk_stub`] at the position of `reader`
    /// and returns the RVA of the slot it jumps through.
    #[must_use]
    pub fn extract_thunk_address(self, image_base: u64, reader: &mut BinaryStreamReader) -> Option<u32> {
        let rva_of = |address: u64| u32::try_from(address.checked_sub(image_base)?).ok();
        match self {
            Platform::I386 => {
                if reader.read_u8().ok()? != 0xFF || reader.read_u8().ok()? != 0x25 {
                    return None;
                }
                rva_of(u64::from(reader.read_u32().ok()?))
            }
            Platform::Amd64 => {
                if reader.read_u8().ok()? != 0x48 || reader.read_u8().ok()? != 0xA1 {
                    return None;
                }
                let address = reader.read_u64().ok()?;
                if reader.read_u8().ok()? != 0xFF || reader.read_u8().ok()? != 0xE0 {
                    return None;
                }
                rva_of(address)
            }
            Platform::Arm64 => {
                let current_page = (image_base + u64::from(reader.rva())) & !0xFFF;
                let adrp = reader.read_u32().ok()?;
                let ldr = reader.read_u32().ok()?;
                let br = reader.read_u32().ok()?;
                if adrp & ADRP_MASK != ADRP_X16 || ldr & LDR_MASK != LDR_X16 || br != BR_X16 {
                    return None;
                }

                let immhi = u64::from((adrp >> 5) & 0x7_FFFF);
                let immlo = u64::from((adrp >> 29) & 0b11);
                let page = current_page.wrapping_add(((immhi << 2) | immlo) << 12);
                let page_offset = u64::from((ldr >> 10) & 0xFFF) << 3;
                rva_of(page | page_offset)
            }
        }
    }
}

fn relocatable_stub(
    code: DataSegment,
    operand_offset: u32,
    kind: AddressFixupKind,
    relocation: RelocationType,
    slot: Arc<dyn AddressReference>,
) -> ThunkStub {
    let segment: SegmentRef = Arc::new(PatchedSegment::new(Arc::new(code)).with_patch(
        Patch::AddressFixup {
            relative_offset: operand_offset,
            kind,
            symbol: slot,
        },
    ));
    let operand = SegmentReference::with_offset(Arc::clone(&segment), operand_offset);
    ThunkStub {
        segment,
        relocations: vec![BaseRelocation::new(relocation, Arc::new(operand))],
    }
}

const ADRP_MASK: u32 = 0b1_00_11111_0000000000000000000_11111;
const ADRP_X16: u32 = 0b1_00_10000_0000000000000000000_10000;
const LDR_MASK: u32 = 0b11_111_1_11_11_000000000000_11111_11111;
const LDR_X16: u32 = 0b11_111_0_01_01_000000000000_10000_10000;
const BR_X16: u32 = 0b1101011_0_0_00_11111_0000_0_0_10000_00000;

/// `adrp x16, slot@page; ldr x16, [x16, slot@pageoff]; br x16`.
///
/// The instructions are PC-relative, so no base relocation is needed.
struct Arm64ThunkStub {
    slot: Arc<dyn AddressReference>,
    offsets: SegmentOffsets,
    image_base: AtomicU64,
}

impl Arm64ThunkStub {
    fn new(slot: Arc<dyn AddressReference>) -> Self {
        Arm64ThunkStub {
            slot,
            offsets: SegmentOffsets::default(),
            image_base: AtomicU64::new(0),
        }
    }
}

impl Segment for Arm64ThunkStub {
    fn offset(&self) -> u64 {
        self.offsets.offset()
    }

    fn rva(&self) -> u32 {
        self.offsets.rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets.update(parameters);
        self.image_base.store(parameters.image_base, Ordering::Release);
    }

    fn physical_size(&self) -> u32 {
        12
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        let image_base = self.image_base.load(Ordering::Acquire);
        let current_page = (image_base + u64::from(self.rva())) & !0xFFF;
        let target = image_base + u64::from(self.slot.rva());

        let pages = ((target & !0xFFF).wrapping_sub(current_page) >> 12) as u32;
        writer.write_u32(ADRP_X16 | ((pages >> 2) & 0x7_FFFF) << 5 | (pages & 0b11) << 29)?;
        writer.write_u32(LDR_X16 | (((target & 0xFFF) as u32) >> 3) << 10)?;
        writer.write_u32(BR_X16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{segment::VirtualAddress, Error};

    fn place(stub: &ThunkStub, image_base: u64, rva: u32, is_32bit: bool) -> Vec<u8> {
        stub.segment
            .update_offsets(&RelocationParameters::with_image(image_base, 0x400, rva, is_32bit));
        stub.segment.to_bytes().unwrap()
    }

    #[test]
    fn platform_selection() {
        assert_eq!(Platform::get(MachineType::I386).unwrap(), Platform::I386);
        assert_eq!(Platform::get(MachineType::Arm64).unwrap(), Platform::Arm64);
        assert!(matches!(Platform::get(MachineType::Arm), Err(Error::NotSupported(_))));
        assert!(Platform::I386.is_clr_bootstrapper_required());
        assert!(!Platform::Amd64.is_clr_bootstrapper_required());
        assert_eq!(Platform::Amd64.pointer_size(), 8);
    }

    #[test]
    fn i386_stub() {
        let stub = Platform::I386.create_thunk_stub(Arc::new(VirtualAddress(0x2000)));
        let bytes = place(&stub, 0x40_0000, 0x2100, true);
        assert_eq!(bytes, [0xFF, 0x25, 0x00, 0x20, 0x40, 0x00]);

        assert_eq!(stub.relocations.len(), 1);
        assert_eq!(stub.relocations[0].kind, RelocationType::HighLow);
        assert_eq!(stub.relocations[0].location.rva(), 0x2102);

        let mut reader = BinaryStreamReader::from_bytes(bytes);
        assert_eq!(Platform::I386.extract_thunk_address(0x40_0000, &mut reader), Some(0x2000));
    }

    #[test]
    fn amd64_stub() {
        let stub = Platform::Amd64.create_thunk_stub(Arc::new(VirtualAddress(0x2000)));
        let bytes = place(&stub, 0x1_4000_0000, 0x2100, false);
        assert_eq!(&bytes[..2], &[0x48, 0xA1]);
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 0x1_4000_2000);
        assert_eq!(&bytes[10..], &[0xFF, 0xE0]);
        assert_eq!(stub.relocations[0].kind, RelocationType::Dir64);

        let mut reader = BinaryStreamReader::from_bytes(bytes);
        assert_eq!(Platform::Amd64.extract_thunk_address(0x1_4000_0000, &mut reader), Some(0x2000));
    }

    #[test]
    fn arm64_stub_round_trips() {
        let stub = Platform::Arm64.create_thunk_stub(Arc::new(VirtualAddress(0x3008)));
        assert!(stub.relocations.is_empty());
        let bytes = place(&stub, 0x1_4000_0000, 0x2100, false);
        assert_eq!(bytes.len(), 12);

        let source = crate::io::ByteArrayDataSource::new(bytes);
        let mut reader = BinaryStreamReader::new(Arc::new(source), 0, 0x2100, 12).unwrap();
        assert_eq!(Platform::Arm64.extract_thunk_address(0x1_4000_0000, &mut reader), Some(0x3008));
    }

    #[test]
    fn foreign_code_is_not_a_stub() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0x90; 16]);
        assert_eq!(Platform::I386.extract_thunk_address(0x40_0000, &mut reader), None);
    }
}
