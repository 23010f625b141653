//! Token rewriting in raw method bodies.
//!
//! When a body only needs its metadata references updated, decoding it into instructions and
//! assembling it again is wasted work. The functions here copy the byte code and only touch
//! the token operands and the catch type tokens of exception handlers.

use super::{
    handler::{CilExceptionHandlerType, FAT_CLAUSE_SIZE, TINY_CLAUSE_SIZE},
    raw::{CilExtraSection, CilRawFatMethodBody, CilRawMethodBody, CilRawTinyMethodBody},
    CilCode, CilOperandType, OperandBuilder, OperandResolver,
};
use crate::{
    io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter},
    metadata::Token,
    Result,
};

/// Copies `code`, passing every member and string token through `resolver` and `builder`.
/// Tokens the resolver does not know are copied unchanged.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for an undefined opcode, [`crate::Error::EndOfStream`]
/// for a truncated operand, or an error of the resolver or builder.
pub fn rewrite_code(
    code: &[u8],
    resolver: &dyn OperandResolver,
    builder: &mut dyn OperandBuilder,
) -> Result<Vec<u8>> {
    let mut reader = BinaryStreamReader::from_bytes(code.to_vec());
    let mut writer = MemoryStreamWriter::with_capacity(code.len());

    while reader.remaining() > 0 {
        let first = reader.read_u8()?;
        writer.write_u8(first)?;
        let second = if first == 0xFE {
            let second = reader.read_u8()?;
            writer.write_u8(second)?;
            Some(second)
        } else {
            None
        };
        let code = CilCode::from_bytes(first, second).ok_or_else(|| {
            malformed_error!(
                "Undefined opcode {:02X}{} at IL_{:04X}",
                first,
                second.map(|b| format!(" {b:02X}")).unwrap_or_default(),
                reader.relative_offset()
            )
        })?;

        match code.operand_type() {
            CilOperandType::InlineSwitch => {
                let count = reader.read_u32()?;
                writer.write_u32(count)?;
                let labels = reader.read_exact(count.saturating_mul(4))?;
                writer.write_bytes(&labels)?;
            }
            CilOperandType::InlinePhi => {
                return Err(not_supported_error!("Opcode {} is not supported", code))
            }
            CilOperandType::InlineString => {
                let token = Token::new(reader.read_u32()?);
                let token = match resolver.resolve_string(token)? {
                    Some(value) => builder.string_token(&value)?,
                    None => token,
                };
                writer.write_u32(token.value())?;
            }
            operand_type if operand_type.is_token() => {
                let token = Token::new(reader.read_u32()?);
                let token = match resolver.resolve_member(token)? {
                    Some(member) => builder.member_token(member)?,
                    None => token,
                };
                writer.write_u32(token.value())?;
            }
            operand_type => {
                let operand = reader.read_exact(operand_type.fixed_size())?;
                writer.write_bytes(&operand)?;
            }
        }
    }

    Ok(writer.into_inner())
}

/// Copies an exception handler section, updating the catch type token of typed clauses.
/// Other sections are returned unchanged.
///
/// # Errors
/// Returns an error of the resolver or builder.
pub fn rewrite_exception_handlers(
    section: &CilExtraSection,
    resolver: &dyn OperandResolver,
    builder: &mut dyn OperandBuilder,
) -> Result<CilExtraSection> {
    if !section.is_eh_table() {
        return Ok(section.clone());
    }

    let entry_size = if section.is_fat() {
        FAT_CLAUSE_SIZE as usize
    } else {
        TINY_CLAUSE_SIZE as usize
    };

    let mut data = section.data.clone();
    for entry in data.chunks_exact_mut(entry_size) {
        let kind = if section.is_fat() {
            u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]])
        } else {
            u32::from(u16::from_le_bytes([entry[0], entry[1]]))
        };
        if kind != CilExceptionHandlerType::Exception as u32 {
            continue;
        }

        let tail = &mut entry[entry_size - 4..];
        let token = Token::new(u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]));
        if let Some(member) = resolver.resolve_member(token)? {
            tail.copy_from_slice(&builder.member_token(member)?.value().to_le_bytes());
        }
    }

    Ok(CilExtraSection::new(section.attributes, data))
}

/// Rewrites the tokens of a raw body, keeping its header and layout.
///
/// # Errors
/// See [`rewrite_code`] and [`rewrite_exception_handlers`].
pub fn rewrite_body(
    body: &CilRawMethodBody,
    resolver: &dyn OperandResolver,
    builder: &mut dyn OperandBuilder,
) -> Result<CilRawMethodBody> {
    let code = rewrite_code(body.code(), resolver, builder)?;
    match body {
        CilRawMethodBody::Tiny(_) => Ok(CilRawMethodBody::Tiny(CilRawTinyMethodBody::new(code)?)),
        CilRawMethodBody::Fat(fat) => {
            let mut rewritten =
                CilRawFatMethodBody::new(fat.attributes, fat.max_stack, fat.local_var_sig_token, code);
            for section in &fat.extra_sections {
                rewritten
                    .extra_sections
                    .push(rewrite_exception_handlers(section, resolver, builder)?);
            }
            Ok(CilRawMethodBody::Fat(rewritten))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cil::{
            ArgumentRef, CilRawExceptionHandler, LocalRef, MethodSignatureInfo,
            CilMethodBodyAttributes,
        },
        metadata::TableIndex,
        segment::Segment,
    };
    use widestring::{U16Str, U16String};

    /// Maps `MemberRef` row `n` to row `n + 0x10` and knows a single literal.
    struct Remap;

    impl OperandResolver for Remap {
        fn resolve_member(&self, token: Token) -> Result<Option<Token>> {
            Ok((token.table_index() == Some(TableIndex::MemberRef)).then_some(token))
        }

        fn resolve_string(&self, token: Token) -> Result<Option<U16String>> {
            Ok((token.rid() == 1).then(|| U16String::from_str("hello")))
        }

        fn resolve_local(&self, index: u16) -> Option<LocalRef> {
            MethodSignatureInfo::default().resolve_local(index)
        }

        fn resolve_argument(&self, index: u16) -> Option<ArgumentRef> {
            MethodSignatureInfo::default().resolve_argument(index)
        }
    }

    impl OperandBuilder for Remap {
        fn member_token(&mut self, token: Token) -> Result<Token> {
            Ok(Token::from_parts(TableIndex::MemberRef, token.rid() + 0x10))
        }

        fn string_token(&mut self, _value: &U16Str) -> Result<Token> {
            Ok(Token::from_parts(TableIndex::String, 0x20))
        }

        fn variable_index(&mut self, local: LocalRef) -> Result<u16> {
            Ok(local.index())
        }

        fn argument_index(&mut self, argument: ArgumentRef) -> Result<u16> {
            Ok(argument.index(false))
        }
    }

    #[test]
    fn tokens_are_rewritten() {
        let code = vec![
            0x72, 0x01, 0x00, 0x00, 0x70, // ldstr 0x70000001
            0x28, 0x02, 0x00, 0x00, 0x0A, // call 0x0A000002
            0x28, 0x03, 0x00, 0x00, 0x06, // call 0x06000003
            0x45, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // switch (+0)
            0x20, 0x28, 0x00, 0x00, 0x0A, // ldc.i4 0x0A000028
            0x2A,
        ];
        let rewritten = rewrite_code(&code, &Remap, &mut Remap).unwrap();

        let mut expected = code.clone();
        expected[1] = 0x20;
        expected[6] = 0x12;
        assert_eq!(rewritten, expected);
    }

    #[test]
    fn catch_types_are_rewritten() {
        let typed = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Exception,
            try_offset: 0,
            try_length: 1,
            handler_offset: 1,
            handler_length: 1,
            extra: Token::from_parts(TableIndex::MemberRef, 1).value(),
        };
        let finally = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Finally,
            extra: 0,
            ..typed
        };

        let mut fat = CilRawFatMethodBody::new(
            CilMethodBodyAttributes::FAT,
            2,
            Token::NULL,
            vec![0x00, 0x00, 0x2A],
        );
        fat.extra_sections
            .push(CilExtraSection::from_handlers(&[typed, finally]).unwrap());
        let body = CilRawMethodBody::Fat(fat);

        let rewritten = rewrite_body(&body, &Remap, &mut Remap).unwrap();
        assert_eq!(rewritten.physical_size(), body.physical_size());
        let CilRawMethodBody::Fat(rewritten) = rewritten else {
            panic!("expected a fat body");
        };
        let clauses = rewritten.exception_handlers().unwrap();
        assert_eq!(
            clauses[0].extra,
            Token::from_parts(TableIndex::MemberRef, 0x11).value()
        );
        assert_eq!(clauses[1], finally);
    }
}
