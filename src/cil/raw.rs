//! Method bodies in their serialized form.
//!
//! A raw body is the header, the code bytes and, for fat bodies, the chain of extra data
//! sections that follow the code. Instructions are not decoded here; see
//! [`super::CilMethodBody`] for the structured form.
//!
//! ```rust
//! use peweave::cil::{CilRawMethodBody, CilRawTinyMethodBody};
//! use peweave::segment::Segment;
//!
//! // ldarg.0; ret
//! let body = CilRawMethodBody::Tiny(CilRawTinyMethodBody::new(vec![0x02, 0x2A])?);
//! assert_eq!(body.to_bytes()?, vec![0x0A, 0x02, 0x2A]);
//! # Ok::<(), peweave::Error>(())
//! ```

use bitflags::bitflags;

use super::handler::{CilRawExceptionHandler, FAT_CLAUSE_SIZE, TINY_CLAUSE_SIZE};
use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter},
    metadata::Token,
    segment::{RelocationParameters, Segment, SegmentOffsets},
    utils::{align_up_u32, to_u32},
    Error, Result,
};

/// Largest code size a tiny header can describe.
pub const TINY_MAX_CODE_SIZE: u32 = 0x3F;
/// Size of a fat header.
pub const FAT_HEADER_SIZE: u32 = 12;

bitflags! {
    /// Flags in the first bytes of a method body header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CilMethodBodyAttributes: u16 {
        /// Tiny header.
        const TINY = 0x2;
        /// Fat header.
        const FAT = 0x3;
        /// Extra data sections follow the code.
        const MORE_SECTIONS = 0x8;
        /// Locals are zero-initialized.
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Flags of an extra data section header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CilExtraSectionAttributes: u8 {
        /// The section holds exception handler clauses.
        const EH_TABLE = 0x1;
        /// Reserved optimized IL table.
        const OPT_IL_TABLE = 0x2;
        /// 24-bit data size and fat clauses.
        const FAT_FORMAT = 0x40;
        /// Another section follows.
        const MORE_SECTIONS = 0x80;
    }
}

/// An extra data section of a fat method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CilExtraSection {
    /// Section flags. [`CilExtraSectionAttributes::MORE_SECTIONS`] is managed by the owning body
    /// when it is written.
    pub attributes: CilExtraSectionAttributes,
    /// Section payload, without the header.
    pub data: Vec<u8>,
}

impl CilExtraSection {
    /// Creates a section.
    #[must_use]
    pub fn new(attributes: CilExtraSectionAttributes, data: Vec<u8>) -> Self {
        CilExtraSection { attributes, data }
    }

    /// Creates an exception handler section holding `clauses`, choosing the fat format if any
    /// clause needs it.
    ///
    /// # Errors
    /// Returns an error if the clauses do not fit a section.
    pub fn from_handlers(clauses: &[CilRawExceptionHandler]) -> Result<Self> {
        let fat = clauses.iter().any(CilRawExceptionHandler::is_fat);

        let mut writer = crate::io::MemoryStreamWriter::new();
        for clause in clauses {
            clause.write(&mut writer, fat)?;
        }

        let mut attributes = CilExtraSectionAttributes::EH_TABLE;
        if fat {
            attributes |= CilExtraSectionAttributes::FAT_FORMAT;
        }
        let section = CilExtraSection::new(attributes, writer.into_inner());
        if !fat && section.data.len() + 4 > usize::from(u8::MAX) {
            // Too many tiny clauses for a one-byte size; re-encode as fat.
            let mut writer = crate::io::MemoryStreamWriter::new();
            for clause in clauses {
                clause.write(&mut writer, true)?;
            }
            return Ok(CilExtraSection::new(
                CilExtraSectionAttributes::EH_TABLE | CilExtraSectionAttributes::FAT_FORMAT,
                writer.into_inner(),
            ));
        }
        Ok(section)
    }

    /// Returns `true` if this is an exception handler section.
    #[must_use]
    pub fn is_eh_table(&self) -> bool {
        self.attributes.contains(CilExtraSectionAttributes::EH_TABLE)
    }

    /// Returns `true` if the section uses the fat format.
    #[must_use]
    pub fn is_fat(&self) -> bool {
        self.attributes
            .contains(CilExtraSectionAttributes::FAT_FORMAT)
    }

    /// Size of the section including its 4-byte header.
    #[must_use]
    pub fn size(&self) -> u32 {
        4 + u32::try_from(self.data.len()).unwrap_or(u32::MAX - 4)
    }

    /// Decodes the clauses of an exception handler section. The clause count follows from the
    /// payload size.
    ///
    /// # Errors
    /// Returns an error if this is not an exception handler section or a clause is invalid.
    pub fn handlers(&self) -> Result<Vec<CilRawExceptionHandler>> {
        if !self.is_eh_table() {
            return Err(Error::InvalidArgument(
                "Extra section does not hold exception handlers".to_string(),
            ));
        }

        let clause_size = if self.is_fat() {
            FAT_CLAUSE_SIZE
        } else {
            TINY_CLAUSE_SIZE
        };
        let count = to_u32(self.data.len())? / clause_size;

        let mut reader = BinaryStreamReader::from_bytes(self.data.clone());
        (0..count)
            .map(|_| CilRawExceptionHandler::from_reader(&mut reader, self.is_fat()))
            .collect()
    }

    /// Reads one section header and its payload.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the declared size is smaller than the header, or
    /// [`Error::EndOfStream`] if the payload is truncated.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let attributes = CilExtraSectionAttributes::from_bits_retain(reader.read_u8()?);
        let size = if attributes.contains(CilExtraSectionAttributes::FAT_FORMAT) {
            let low = u32::from(reader.read_u16()?);
            let high = u32::from(reader.read_u8()?);
            low | (high << 16)
        } else {
            let size = u32::from(reader.read_u8()?);
            reader.read_u16()?;
            size
        };

        if size < 4 {
            return Err(malformed_error!(
                "Extra section size {} is smaller than its header",
                size
            ));
        }

        Ok(CilExtraSection {
            attributes,
            data: reader.read_exact(size - 4)?,
        })
    }

    /// Writes the header and payload. `more` sets the flag announcing a following section.
    ///
    /// # Errors
    /// Returns an error if the section is too large for its format, or any error of the writer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter, more: bool) -> Result<()> {
        let mut attributes = self.attributes - CilExtraSectionAttributes::MORE_SECTIONS;
        if more {
            attributes |= CilExtraSectionAttributes::MORE_SECTIONS;
        }

        let size = self.size();
        writer.write_u8(attributes.bits())?;
        if self.is_fat() {
            if size > 0x00FF_FFFF {
                return Err(Error::InvalidArgument(format!(
                    "Extra section of {size} bytes is too large"
                )));
            }
            writer.write_u16(size as u16)?;
            writer.write_u8((size >> 16) as u8)?;
        } else {
            if size > u32::from(u8::MAX) {
                return Err(Error::InvalidArgument(format!(
                    "Extra section of {size} bytes does not fit the tiny format"
                )));
            }
            writer.write_u8(size as u8)?;
            writer.write_u16(0)?;
        }
        writer.write_bytes(&self.data)
    }
}

/// A method body with a one-byte header.
#[derive(Debug, Clone)]
pub struct CilRawTinyMethodBody {
    code: Vec<u8>,
    offsets: SegmentOffsets,
}

impl CilRawTinyMethodBody {
    /// Creates a tiny body.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the code is longer than 63 bytes.
    pub fn new(code: Vec<u8>) -> Result<Self> {
        if code.len() > TINY_MAX_CODE_SIZE as usize {
            return Err(Error::InvalidArgument(format!(
                "Code of {} bytes does not fit a tiny method body",
                code.len()
            )));
        }
        Ok(CilRawTinyMethodBody {
            code,
            offsets: SegmentOffsets::default(),
        })
    }

    /// The code bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The header byte.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn header(&self) -> u8 {
        CilMethodBodyAttributes::TINY.bits() as u8 | ((self.code.len() as u8) << 2)
    }
}

/// A method body with a 12-byte header.
#[derive(Debug, Clone)]
pub struct CilRawFatMethodBody {
    /// Header flags. The format and `MORE_SECTIONS` bits are derived when written.
    pub attributes: CilMethodBodyAttributes,
    /// Maximum evaluation stack depth.
    pub max_stack: u16,
    /// Local variable signature, or [`Token::NULL`].
    pub local_var_sig_token: Token,
    code: Vec<u8>,
    /// Extra data sections following the code.
    pub extra_sections: Vec<CilExtraSection>,
    offsets: SegmentOffsets,
}

impl CilRawFatMethodBody {
    /// Creates a fat body without extra sections.
    #[must_use]
    pub fn new(
        attributes: CilMethodBodyAttributes,
        max_stack: u16,
        local_var_sig_token: Token,
        code: Vec<u8>,
    ) -> Self {
        CilRawFatMethodBody {
            attributes,
            max_stack,
            local_var_sig_token,
            code,
            extra_sections: Vec::new(),
            offsets: SegmentOffsets::default(),
        }
    }

    /// The code bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Returns `true` if locals are zero-initialized.
    #[must_use]
    pub fn init_locals(&self) -> bool {
        self.attributes.contains(CilMethodBodyAttributes::INIT_LOCALS)
    }

    /// The first `u16` of the header: flags in the low 12 bits, header size in dwords on top.
    #[must_use]
    pub fn header_flags(&self) -> u16 {
        let mut attributes = (self.attributes
            - CilMethodBodyAttributes::MORE_SECTIONS
            - CilMethodBodyAttributes::TINY)
            | CilMethodBodyAttributes::FAT;
        if !self.extra_sections.is_empty() {
            attributes |= CilMethodBodyAttributes::MORE_SECTIONS;
        }
        attributes.bits() | ((FAT_HEADER_SIZE as u16 / 4) << 12)
    }

    /// Decoded exception handler clauses of all exception handler sections.
    ///
    /// # Errors
    /// Returns an error if a clause is invalid.
    pub fn exception_handlers(&self) -> Result<Vec<CilRawExceptionHandler>> {
        let mut handlers = Vec::new();
        for section in self.extra_sections.iter().filter(|s| s.is_eh_table()) {
            handlers.extend(section.handlers()?);
        }
        Ok(handlers)
    }

    fn code_end(&self) -> u32 {
        FAT_HEADER_SIZE + u32::try_from(self.code.len()).unwrap_or(u32::MAX - FAT_HEADER_SIZE)
    }
}

/// A raw method body in either header format.
#[derive(Debug, Clone)]
pub enum CilRawMethodBody {
    /// One-byte header.
    Tiny(CilRawTinyMethodBody),
    /// Twelve-byte header with optional extra sections.
    Fat(CilRawFatMethodBody),
}

impl CilRawMethodBody {
    /// Reads a body at the reader's position. The reader is left after the last byte of the
    /// body.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the low bits of the header select neither format, or
    /// [`Error::EndOfStream`] if the body is truncated.
    pub fn from_reader(reader: &mut BinaryStreamReader) -> Result<Self> {
        let offset = reader.offset();
        let rva = reader.rva();
        let first = reader.read_u8()?;

        let body = match first & 0b11 {
            0b10 => {
                let code = reader.read_exact(u32::from(first >> 2))?;
                CilRawMethodBody::Tiny(CilRawTinyMethodBody {
                    code,
                    offsets: SegmentOffsets::default(),
                })
            }
            0b11 => {
                let flags = u16::from(first) | (u16::from(reader.read_u8()?) << 8);
                let header_size = u32::from(flags >> 12) * 4;
                if header_size < FAT_HEADER_SIZE {
                    return Err(malformed_error!(
                        "Fat method body header of {} bytes is too small",
                        header_size
                    ));
                }

                let attributes = CilMethodBodyAttributes::from_bits_retain(flags & 0x0FFF);
                let max_stack = reader.read_u16()?;
                let code_size = reader.read_u32()?;
                let local_var_sig_token = Token::new(reader.read_u32()?);
                reader.skip(header_size - FAT_HEADER_SIZE)?;
                let code = reader.read_exact(code_size)?;

                let mut extra_sections = Vec::new();
                if attributes.contains(CilMethodBodyAttributes::MORE_SECTIONS) {
                    loop {
                        reader.align(4);
                        let section = CilExtraSection::from_reader(reader)?;
                        let more = section
                            .attributes
                            .contains(CilExtraSectionAttributes::MORE_SECTIONS);
                        extra_sections.push(section);
                        if !more {
                            break;
                        }
                    }
                }

                CilRawMethodBody::Fat(CilRawFatMethodBody {
                    attributes,
                    max_stack,
                    local_var_sig_token,
                    code,
                    extra_sections,
                    offsets: SegmentOffsets::default(),
                })
            }
            _ => {
                return Err(malformed_error!(
                    "Invalid method body header 0x{:02X}",
                    first
                ))
            }
        };

        body.update_offsets(&RelocationParameters::new(offset, rva));
        Ok(body)
    }

    /// The code bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        match self {
            CilRawMethodBody::Tiny(body) => body.code(),
            CilRawMethodBody::Fat(body) => body.code(),
        }
    }

    /// Returns `true` for a fat body.
    #[must_use]
    pub fn is_fat(&self) -> bool {
        matches!(self, CilRawMethodBody::Fat(_))
    }

    /// Maximum stack depth; tiny bodies imply 8.
    #[must_use]
    pub fn max_stack(&self) -> u16 {
        match self {
            CilRawMethodBody::Tiny(_) => 8,
            CilRawMethodBody::Fat(body) => body.max_stack,
        }
    }

    /// Local variable signature token, [`Token::NULL`] for tiny bodies.
    #[must_use]
    pub fn local_var_sig_token(&self) -> Token {
        match self {
            CilRawMethodBody::Tiny(_) => Token::NULL,
            CilRawMethodBody::Fat(body) => body.local_var_sig_token,
        }
    }

    fn offsets(&self) -> &SegmentOffsets {
        match self {
            CilRawMethodBody::Tiny(body) => &body.offsets,
            CilRawMethodBody::Fat(body) => &body.offsets,
        }
    }
}

impl Segment for CilRawMethodBody {
    fn offset(&self) -> u64 {
        self.offsets().offset()
    }

    fn rva(&self) -> u32 {
        self.offsets().rva()
    }

    fn update_offsets(&self, parameters: &RelocationParameters) {
        self.offsets().update(parameters);
    }

    fn physical_size(&self) -> u32 {
        match self {
            CilRawMethodBody::Tiny(body) => 1 + to_u32(body.code.len()).unwrap_or(0),
            CilRawMethodBody::Fat(body) => {
                let mut size = body.code_end();
                for section in &body.extra_sections {
                    size = align_up_u32(size, 4) + section.size();
                }
                size
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&self, writer: &mut dyn BinaryStreamWriter) -> Result<()> {
        match self {
            CilRawMethodBody::Tiny(body) => {
                writer.write_u8(body.header())?;
                writer.write_bytes(&body.code)
            }
            CilRawMethodBody::Fat(body) => {
                writer.write_u16(body.header_flags())?;
                writer.write_u16(body.max_stack)?;
                writer.write_u32(to_u32(body.code.len())?)?;
                writer.write_u32(body.local_var_sig_token.value())?;
                writer.write_bytes(&body.code)?;

                let mut position = body.code_end();
                for (i, section) in body.extra_sections.iter().enumerate() {
                    let aligned = align_up_u32(position, 4);
                    writer.write_zeroes(u64::from(aligned - position))?;
                    section.write(writer, i + 1 < body.extra_sections.len())?;
                    position = aligned + section.size();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::CilExceptionHandlerType;

    #[test]
    fn tiny_header() {
        let body = CilRawMethodBody::Tiny(CilRawTinyMethodBody::new(vec![0x02, 0x2A]).unwrap());
        assert_eq!(body.physical_size(), 3);
        assert_eq!(body.to_bytes().unwrap(), [0x0A, 0x02, 0x2A]);

        assert!(CilRawTinyMethodBody::new(vec![0; 64]).is_err());
    }

    #[test]
    fn fat_header_with_locals() {
        let body = CilRawMethodBody::Fat(CilRawFatMethodBody::new(
            CilMethodBodyAttributes::empty(),
            2,
            Token::new(0x1100_0001),
            vec![0; 10],
        ));
        let bytes = body.to_bytes().unwrap();
        assert_eq!(bytes.len(), 22);

        let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(flags & 0x0FFF, 0x3003);
        assert_eq!(flags >> 12, 3);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 2);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 10);
        assert_eq!(
            u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            0x1100_0001
        );
    }

    #[test]
    fn fat_body_with_handlers() {
        let clause = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Finally,
            try_offset: 0,
            try_length: 2,
            handler_offset: 2,
            handler_length: 1,
            extra: 0,
        };

        let mut fat = CilRawFatMethodBody::new(
            CilMethodBodyAttributes::INIT_LOCALS,
            1,
            Token::NULL,
            vec![0x00, 0xDE, 0x00, 0xDC, 0x2A],
        );
        fat.extra_sections
            .push(CilExtraSection::from_handlers(&[clause, clause]).unwrap());
        let body = CilRawMethodBody::Fat(fat);

        // 12 + 5 code, padded to 20, 4 header + 2 * 12 clauses
        assert_eq!(body.physical_size(), 48);
        let bytes = body.to_bytes().unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[17..20], &[0, 0, 0]);
        assert_eq!(bytes[20], CilExtraSectionAttributes::EH_TABLE.bits());
        assert_eq!(bytes[21], 28);

        let mut reader = BinaryStreamReader::from_bytes(bytes);
        let parsed = CilRawMethodBody::from_reader(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        let CilRawMethodBody::Fat(parsed) = parsed else {
            panic!("expected a fat body");
        };
        assert!(parsed.init_locals());
        assert_eq!(parsed.code(), &[0x00, 0xDE, 0x00, 0xDC, 0x2A]);
        let handlers = parsed.exception_handlers().unwrap();
        assert_eq!(handlers, vec![clause, clause]);
    }

    #[test]
    fn large_clause_selects_fat_section() {
        let clause = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Fault,
            try_offset: 0,
            try_length: 0x100,
            handler_offset: 0x100,
            handler_length: 4,
            extra: 0,
        };
        let small = CilRawExceptionHandler {
            try_length: 4,
            handler_offset: 4,
            ..clause
        };

        let section = CilExtraSection::from_handlers(&[small, clause]).unwrap();
        assert!(section.is_fat());
        assert_eq!(section.size(), 4 + 2 * FAT_CLAUSE_SIZE);
        assert_eq!(section.handlers().unwrap(), vec![small, clause]);

        let section = CilExtraSection::from_handlers(&[small]).unwrap();
        assert!(!section.is_fat());
        assert_eq!(section.data.len() as u32 / TINY_CLAUSE_SIZE, 1);
    }

    #[test]
    fn invalid_header_bits() {
        for first in [0x00u8, 0x01, 0x04, 0x05] {
            let mut reader = BinaryStreamReader::from_bytes(vec![first, 0, 0, 0]);
            assert!(CilRawMethodBody::from_reader(&mut reader)
                .unwrap_err()
                .is_malformed());
        }
    }

    #[test]
    fn truncated_tiny_body() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0x0E, 0x02]);
        assert!(CilRawMethodBody::from_reader(&mut reader).is_err());
    }
}
