//! Exception handler clauses.

use std::fmt;

use strum::{Display, FromRepr};

use super::CilLabel;
use crate::{io::BinaryStreamReader, io::BinaryStreamWriter, metadata::Token, Result};

/// Size of a clause in the tiny exception handler format.
pub const TINY_CLAUSE_SIZE: u32 = 12;
/// Size of a clause in the fat exception handler format.
pub const FAT_CLAUSE_SIZE: u32 = 24;

/// Kind of an exception handler clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u32)]
pub enum CilExceptionHandlerType {
    /// A typed `catch` clause.
    Exception = 0,
    /// A clause with a filter block deciding whether the handler runs.
    Filter = 1,
    /// A `finally` clause.
    Finally = 2,
    /// A `fault` clause, run only when an exception leaves the protected block.
    Fault = 4,
}

/// One `try`/handler region pair of a method body.
///
/// Bounds are labels so they keep pointing at the same instructions while the instruction list
/// is edited. `try_end` and `handler_end` are exclusive; [`CilLabel::End`] marks the end of
/// the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CilExceptionHandler {
    /// Kind of clause.
    pub handler_type: CilExceptionHandlerType,
    /// First instruction of the protected block.
    pub try_start: Option<CilLabel>,
    /// First instruction after the protected block.
    pub try_end: Option<CilLabel>,
    /// First instruction of the handler block.
    pub handler_start: Option<CilLabel>,
    /// First instruction after the handler block.
    pub handler_end: Option<CilLabel>,
    /// First instruction of the filter block, for [`CilExceptionHandlerType::Filter`].
    pub filter_start: Option<CilLabel>,
    /// Caught type, for [`CilExceptionHandlerType::Exception`].
    pub exception_type: Option<Token>,
}

impl CilExceptionHandler {
    /// Creates a clause of the given kind with no bounds set.
    #[must_use]
    pub fn new(handler_type: CilExceptionHandlerType) -> Self {
        CilExceptionHandler {
            handler_type,
            try_start: None,
            try_end: None,
            handler_start: None,
            handler_end: None,
            filter_start: None,
            exception_type: None,
        }
    }

    /// Returns `true` if the clause does not fit the tiny encoding, given a function resolving
    /// labels to their current offsets.
    pub fn is_fat(&self, offset_of: impl Fn(&CilLabel) -> Option<u32>) -> bool {
        let bounds = |start: &Option<CilLabel>, end: &Option<CilLabel>| {
            let start = start.as_ref().and_then(&offset_of).unwrap_or(0);
            let end = end.as_ref().and_then(&offset_of).unwrap_or(start);
            (start, end.saturating_sub(start))
        };

        let (try_offset, try_length) = bounds(&self.try_start, &self.try_end);
        let (handler_offset, handler_length) = bounds(&self.handler_start, &self.handler_end);
        is_fat_format_required(try_offset, try_length, handler_offset, handler_length)
    }
}

/// Returns `true` if a clause with these bounds requires the fat encoding.
#[must_use]
pub fn is_fat_format_required(
    try_offset: u32,
    try_length: u32,
    handler_offset: u32,
    handler_length: u32,
) -> bool {
    try_length > u32::from(u8::MAX)
        || handler_length > u32::from(u8::MAX)
        || try_offset > u32::from(u16::MAX)
        || handler_offset > u32::from(u16::MAX)
}

/// A clause as stored in an exception handler section, with offsets instead of labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CilRawExceptionHandler {
    /// Kind of clause.
    pub handler_type: CilExceptionHandlerType,
    /// Offset of the protected block.
    pub try_offset: u32,
    /// Length of the protected block.
    pub try_length: u32,
    /// Offset of the handler block.
    pub handler_offset: u32,
    /// Length of the handler block.
    pub handler_length: u32,
    /// Caught type token for typed clauses, filter offset for filter clauses, 0 otherwise.
    pub extra: u32,
}

impl CilRawExceptionHandler {
    /// Returns `true` if the clause does not fit the tiny encoding.
    #[must_use]
    pub fn is_fat(&self) -> bool {
        is_fat_format_required(
            self.try_offset,
            self.try_length,
            self.handler_offset,
            self.handler_length,
        )
    }

    /// Reads one clause.
    ///
    /// # Errors
    /// Returns [`crate::Error::EndOfStream`] if the clause is truncated, or
    /// [`crate::Error::Malformed`] for an unknown clause kind.
    pub fn from_reader(reader: &mut BinaryStreamReader, fat: bool) -> Result<Self> {
        let (kind, try_offset, try_length, handler_offset, handler_length) = if fat {
            (
                reader.read_u32()?,
                reader.read_u32()?,
                reader.read_u32()?,
                reader.read_u32()?,
                reader.read_u32()?,
            )
        } else {
            (
                u32::from(reader.read_u16()?),
                u32::from(reader.read_u16()?),
                u32::from(reader.read_u8()?),
                u32::from(reader.read_u16()?),
                u32::from(reader.read_u8()?),
            )
        };

        let handler_type = CilExceptionHandlerType::from_repr(kind)
            .ok_or_else(|| malformed_error!("Invalid exception handler kind 0x{:X}", kind))?;

        Ok(CilRawExceptionHandler {
            handler_type,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            extra: reader.read_u32()?,
        })
    }

    /// Writes the clause in the tiny or fat encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if a tiny clause is requested for bounds that
    /// do not fit it, or any error of the writer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, writer: &mut dyn BinaryStreamWriter, fat: bool) -> Result<()> {
        if fat {
            writer.write_u32(self.handler_type as u32)?;
            writer.write_u32(self.try_offset)?;
            writer.write_u32(self.try_length)?;
            writer.write_u32(self.handler_offset)?;
            writer.write_u32(self.handler_length)?;
        } else {
            if self.is_fat() {
                return Err(crate::Error::InvalidArgument(format!(
                    "Exception handler {self} does not fit the tiny format"
                )));
            }
            writer.write_u16(self.handler_type as u16)?;
            writer.write_u16(self.try_offset as u16)?;
            writer.write_u8(self.try_length as u8)?;
            writer.write_u16(self.handler_offset as u16)?;
            writer.write_u8(self.handler_length as u8)?;
        }
        writer.write_u32(self.extra)
    }
}

impl fmt::Display for CilRawExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} try IL_{:04X}..IL_{:04X} handler IL_{:04X}..IL_{:04X}",
            self.handler_type,
            self.try_offset,
            self.try_offset + self.try_length,
            self.handler_offset,
            self.handler_offset + self.handler_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStreamWriter;

    fn raw(try_length: u32, handler_offset: u32) -> CilRawExceptionHandler {
        CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Finally,
            try_offset: 0,
            try_length,
            handler_offset,
            handler_length: 4,
            extra: 0,
        }
    }

    #[test]
    fn fat_thresholds() {
        assert!(!raw(255, 65535).is_fat());
        assert!(raw(256, 10).is_fat());
        assert!(raw(10, 65536).is_fat());
    }

    #[test]
    fn tiny_clause_layout() {
        let clause = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Exception,
            try_offset: 1,
            try_length: 10,
            handler_offset: 11,
            handler_length: 6,
            extra: 0x0100_0002,
        };

        let mut writer = MemoryStreamWriter::new();
        clause.write(&mut writer, false).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), TINY_CLAUSE_SIZE as usize);
        assert_eq!(bytes, [0, 0, 1, 0, 10, 11, 0, 6, 2, 0, 0, 1]);

        let mut reader = BinaryStreamReader::from_bytes(bytes);
        assert_eq!(
            CilRawExceptionHandler::from_reader(&mut reader, false).unwrap(),
            clause
        );
    }

    #[test]
    fn tiny_write_rejects_large_clause() {
        let mut writer = MemoryStreamWriter::new();
        assert!(raw(300, 0).write(&mut writer, false).is_err());
        raw(300, 0).write(&mut writer, true).unwrap();
        assert_eq!(writer.as_slice().len(), FAT_CLAUSE_SIZE as usize);
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut reader = BinaryStreamReader::from_bytes(vec![3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(CilRawExceptionHandler::from_reader(&mut reader, false)
            .unwrap_err()
            .is_malformed());
    }

    #[test]
    fn labelled_clause_size() {
        let mut clause = CilExceptionHandler::new(CilExceptionHandlerType::Fault);
        clause.try_start = Some(CilLabel::Offset(0));
        clause.try_end = Some(CilLabel::Offset(0x200));
        clause.handler_start = Some(CilLabel::Offset(0x200));
        clause.handler_end = Some(CilLabel::End);

        let offset_of = |label: &CilLabel| match label {
            CilLabel::Offset(offset) => Some(*offset),
            CilLabel::End => Some(0x210),
            CilLabel::Instruction(_) => None,
        };
        assert!(clause.is_fat(offset_of));

        clause.try_end = Some(CilLabel::Offset(0x20));
        clause.handler_start = Some(CilLabel::Offset(0x20));
        clause.handler_end = Some(CilLabel::Offset(0x30));
        assert!(!clause.is_fat(offset_of));
    }
}
