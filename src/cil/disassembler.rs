//! Decoding CIL byte code into instructions.
//!
//! Decoding is a linear scan: every instruction is read with its raw operand, branch targets as
//! absolute [`CilLabel::Offset`] values and variables as raw indices. [`disassemble`] then
//! resolves the raw operands against the decoded list and an [`OperandResolver`].
//!
//! ```rust
//! use peweave::cil::{decode_stream, CilCode};
//! use peweave::io::BinaryStreamReader;
//!
//! // nop; br.s -3 (back to nop); ret
//! let mut reader = BinaryStreamReader::from_bytes(vec![0x00, 0x2B, 0xFD, 0x2A]);
//! let instructions = decode_stream(&mut reader)?;
//! assert_eq!(instructions.len(), 3);
//! assert_eq!(instructions[1].code(), CilCode::BrS);
//! assert_eq!(instructions[2].offset, 3);
//! # Ok::<(), peweave::Error>(())
//! ```

use super::{
    ArgumentRef, CilCode, CilInstruction, CilInstructionCollection, CilLabel, CilOperand,
    CilOperandType, LocalRef, OperandResolver,
};
use crate::{io::BinaryStreamReader, metadata::Token, Result};

/// Decodes one instruction at the reader's position. Offsets are relative to the start of the
/// reader's window.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for an undefined opcode and
/// [`crate::Error::EndOfStream`] for a truncated operand.
pub fn decode_instruction(reader: &mut BinaryStreamReader) -> Result<CilInstruction> {
    #[allow(clippy::cast_possible_truncation)]
    let offset = reader.relative_offset() as u32;

    let first = reader.read_u8()?;
    let code = if first == 0xFE {
        let second = reader.read_u8()?;
        CilCode::from_bytes(first, Some(second))
            .ok_or_else(|| malformed_error!("Undefined opcode FE {:02X} at IL_{:04X}", second, offset))?
    } else {
        CilCode::from_bytes(first, None)
            .ok_or_else(|| malformed_error!("Undefined opcode {:02X} at IL_{:04X}", first, offset))?
    };

    let operand = read_operand(reader, code)?;
    Ok(CilInstruction::new(code, operand)?.with_offset(offset))
}

fn read_operand(reader: &mut BinaryStreamReader, code: CilCode) -> Result<CilOperand> {
    #[allow(clippy::cast_possible_truncation)]
    let next = |reader: &BinaryStreamReader| reader.relative_offset() as u32;

    Ok(match code.operand_type() {
        CilOperandType::InlineNone => CilOperand::None,
        CilOperandType::ShortInlineI => CilOperand::I8(reader.read_i8()?),
        CilOperandType::InlineI => CilOperand::I32(reader.read_i32()?),
        CilOperandType::InlineI8 => CilOperand::I64(reader.read_i64()?),
        CilOperandType::ShortInlineR => CilOperand::F32(reader.read_f32()?),
        CilOperandType::InlineR => CilOperand::F64(reader.read_f64()?),
        CilOperandType::ShortInlineBrTarget => {
            let displacement = i32::from(reader.read_i8()?);
            CilOperand::Label(CilLabel::Offset(next(reader).wrapping_add_signed(displacement)))
        }
        CilOperandType::InlineBrTarget => {
            let displacement = reader.read_i32()?;
            CilOperand::Label(CilLabel::Offset(next(reader).wrapping_add_signed(displacement)))
        }
        CilOperandType::InlineSwitch => {
            let count = reader.read_u32()?;
            ensure_can_read!(reader, count.saturating_mul(4));
            let displacements = (0..count)
                .map(|_| reader.read_i32())
                .collect::<Result<Vec<_>>>()?;
            let base = next(reader);
            CilOperand::Switch(
                displacements
                    .into_iter()
                    .map(|displacement| CilLabel::Offset(base.wrapping_add_signed(displacement)))
                    .collect(),
            )
        }
        CilOperandType::ShortInlineVar => {
            CilOperand::Local(LocalRef::Index(u16::from(reader.read_u8()?)))
        }
        CilOperandType::InlineVar => CilOperand::Local(LocalRef::Index(reader.read_u16()?)),
        CilOperandType::ShortInlineArgument => {
            CilOperand::Argument(ArgumentRef::Index(u16::from(reader.read_u8()?)))
        }
        CilOperandType::InlineArgument => {
            CilOperand::Argument(ArgumentRef::Index(reader.read_u16()?))
        }
        CilOperandType::InlineField
        | CilOperandType::InlineMethod
        | CilOperandType::InlineSig
        | CilOperandType::InlineString
        | CilOperandType::InlineTok
        | CilOperandType::InlineType => CilOperand::Token(Token::new(reader.read_u32()?)),
        CilOperandType::InlinePhi => {
            return Err(not_supported_error!("Opcode {} is not supported", code))
        }
    })
}

/// Decodes instructions until the end of the reader's window.
///
/// # Errors
/// See [`decode_instruction`].
pub fn decode_stream(reader: &mut BinaryStreamReader) -> Result<Vec<CilInstruction>> {
    let mut instructions = Vec::new();
    while reader.remaining() > 0 {
        instructions.push(decode_instruction(reader)?);
    }
    Ok(instructions)
}

/// Decodes `code` and resolves branch targets, variables and tokens.
///
/// Branch targets that do not start an instruction stay raw [`CilLabel::Offset`] values, which
/// [`CilInstructionCollection::is_label_present`] reports as missing.
///
/// # Errors
/// See [`decode_instruction`]; resolver errors are propagated.
pub fn disassemble(
    code: &[u8],
    resolver: &dyn OperandResolver,
    has_this: bool,
) -> Result<CilInstructionCollection> {
    let mut reader = BinaryStreamReader::from_bytes(code.to_vec());
    let mut instructions = CilInstructionCollection::new(has_this);
    for instruction in decode_stream(&mut reader)? {
        instructions.push(instruction);
    }

    let ids: Vec<_> = instructions.ids().collect();
    for id in ids {
        let Some(instruction) = instructions.get(id) else {
            continue;
        };
        let resolved = match instruction.operand() {
            CilOperand::Label(CilLabel::Offset(target)) => {
                Some(CilOperand::Label(instructions.label_at(*target)))
            }
            CilOperand::Switch(labels) => Some(CilOperand::Switch(
                labels
                    .iter()
                    .map(|label| match label {
                        CilLabel::Offset(target) => instructions.label_at(*target),
                        other => *other,
                    })
                    .collect(),
            )),
            CilOperand::Local(LocalRef::Index(index)) => resolver
                .resolve_local(*index)
                .map(CilOperand::Local),
            CilOperand::Argument(ArgumentRef::Index(index)) => resolver
                .resolve_argument(*index)
                .map(CilOperand::Argument),
            CilOperand::Token(token)
                if instruction.opcode().operand_type == CilOperandType::InlineString =>
            {
                resolver.resolve_string(*token)?.map(CilOperand::String)
            }
            CilOperand::Token(token) => resolver.resolve_member(*token)?.map(CilOperand::Token),
            _ => None,
        };

        if let Some(operand) = resolved {
            if let Some(instruction) = instructions.get_mut(id) {
                instruction.set_operand(operand)?;
            }
        }
    }

    tracing::trace!(
        instructions = instructions.len(),
        size = code.len(),
        "disassembled method body"
    );
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{MethodSignatureInfo, SignatureOperandResolver};

    #[test]
    fn two_byte_opcode() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0xFE, 0x0C, 0x01, 0x01]);
        let instruction = decode_instruction(&mut reader).unwrap();
        assert_eq!(instruction.code(), CilCode::Ldloc);
        assert_eq!(instruction.operand(), &CilOperand::Local(LocalRef::Index(0x0101)));
        assert_eq!(instruction.size(), 4);
    }

    #[test]
    fn undefined_opcodes() {
        for bytes in [vec![0x24], vec![0xFE, 0x30]] {
            let mut reader = BinaryStreamReader::from_bytes(bytes);
            assert!(decode_instruction(&mut reader).unwrap_err().is_malformed());
        }
    }

    #[test]
    fn truncated_operand() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0x20, 0x01, 0x02]);
        assert!(decode_instruction(&mut reader).is_err());
    }

    #[test]
    fn switch_targets() {
        // switch (IL_000E, IL_000F); nop; nop; ret
        let code = vec![
            0x45, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x2A,
        ];
        let mut reader = BinaryStreamReader::from_bytes(code.clone());
        let raw = decode_stream(&mut reader).unwrap();
        assert_eq!(
            raw[0].operand(),
            &CilOperand::Switch(vec![CilLabel::Offset(0x0E), CilLabel::Offset(0x0F)])
        );

        let instructions =
            disassemble(&code, &SignatureOperandResolver::default(), false).unwrap();
        let CilOperand::Switch(labels) = instructions.at(0).unwrap().operand() else {
            panic!("expected a switch");
        };
        assert_eq!(labels[0], CilLabel::Instruction(instructions.id_at(2).unwrap()));
        assert_eq!(labels[1], CilLabel::Instruction(instructions.id_at(3).unwrap()));
    }

    #[test]
    fn resolves_operands() {
        // ldarg.s 0; ldloc.s 1; stloc.s 5; br.s +0; brtrue.s -3; ret
        let code = vec![
            0x0E, 0x00, 0x11, 0x01, 0x13, 0x05, 0x2B, 0x00, 0x2D, 0xFD, 0x2A,
        ];
        let resolver = SignatureOperandResolver::new(MethodSignatureInfo {
            has_this: true,
            parameter_count: 1,
            locals_count: Some(2),
        });
        let instructions = disassemble(&code, &resolver, true).unwrap();
        assert_eq!(instructions.len(), 6);

        let operands: Vec<&CilOperand> = instructions.iter().map(CilInstruction::operand).collect();
        assert_eq!(operands[0], &CilOperand::Argument(ArgumentRef::This));
        assert_eq!(operands[1], &CilOperand::Local(LocalRef::Variable(1)));
        assert_eq!(operands[2], &CilOperand::Local(LocalRef::Index(5)));
        assert_eq!(
            operands[3],
            &CilOperand::Label(CilLabel::Instruction(instructions.id_at(4).unwrap()))
        );
        // 0x0A - 3 = 0x07, the middle of br.s
        assert_eq!(operands[4], &CilOperand::Label(CilLabel::Offset(0x07)));
        assert!(!instructions.is_label_present(&CilLabel::Offset(0x07)));
    }

    #[test]
    fn branch_to_end() {
        // br.s +1 past ret
        let code = vec![0x2B, 0x01, 0x2A];
        let instructions =
            disassemble(&code, &SignatureOperandResolver::default(), false).unwrap();
        assert_eq!(
            instructions.at(0).unwrap().operand(),
            &CilOperand::Label(CilLabel::End)
        );
    }
}
