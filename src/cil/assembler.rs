//! Encoding instructions into CIL byte code.

use super::{
    CilInstruction, CilInstructionCollection, CilLabel, CilOperand, CilOperandType, OperandBuilder,
};
use crate::{
    io::{BinaryStreamWriter, MemoryStreamWriter},
    metadata::Token,
    Error, Result,
};

/// Encodes instructions with their current offsets.
///
/// Offsets must have been calculated after the last edit; branch displacements are derived
/// from them.
pub struct CilAssembler<'a> {
    instructions: &'a CilInstructionCollection,
    operands: &'a mut dyn OperandBuilder,
}

impl<'a> CilAssembler<'a> {
    /// Creates an assembler for `instructions`, encoding references through `operands`.
    pub fn new(
        instructions: &'a CilInstructionCollection,
        operands: &'a mut dyn OperandBuilder,
    ) -> Self {
        CilAssembler {
            instructions,
            operands,
        }
    }

    /// Encodes all instructions.
    ///
    /// # Errors
    /// Returns [`Error::NullToken`] for a member operand whose token is null,
    /// [`Error::InvalidOperand`] for an operand that does not fit its encoding and
    /// [`Error::InvalidArgument`] for a label that cannot be resolved.
    pub fn assemble(mut self) -> Result<Vec<u8>> {
        let instructions = self.instructions;
        let mut writer = MemoryStreamWriter::with_capacity(instructions.size() as usize);
        for instruction in instructions.iter() {
            self.write_instruction(&mut writer, instruction)?;
        }
        Ok(writer.into_inner())
    }

    /// Encodes one instruction.
    ///
    /// # Errors
    /// See [`CilAssembler::assemble`].
    pub fn write_instruction(
        &mut self,
        writer: &mut dyn BinaryStreamWriter,
        instruction: &CilInstruction,
    ) -> Result<()> {
        let opcode = instruction.opcode();
        writer.write_u8(opcode.byte1())?;
        if let Some(second) = opcode.byte2() {
            writer.write_u8(second)?;
        }

        let mnemonic = opcode.mnemonic;
        let invalid = |message: String| Error::InvalidOperand { mnemonic, message };

        match (opcode.operand_type, instruction.operand()) {
            (_, CilOperand::None) => Ok(()),
            (_, CilOperand::I8(value)) => writer.write_i8(*value),
            (_, CilOperand::I32(value)) => writer.write_i32(*value),
            (_, CilOperand::I64(value)) => writer.write_i64(*value),
            (_, CilOperand::F32(value)) => writer.write_f32(*value),
            (_, CilOperand::F64(value)) => writer.write_f64(*value),
            (operand_type, CilOperand::Label(label)) => {
                let next = i64::from(instruction.offset) + i64::from(instruction.size());
                let displacement = i64::from(self.label_offset(label)?) - next;
                if operand_type == CilOperandType::ShortInlineBrTarget {
                    let displacement = i8::try_from(displacement).map_err(|_| {
                        invalid(format!("Branch displacement {displacement} does not fit 8 bits"))
                    })?;
                    writer.write_i8(displacement)
                } else {
                    let displacement = i32::try_from(displacement).map_err(|_| {
                        invalid(format!("Branch displacement {displacement} does not fit 32 bits"))
                    })?;
                    writer.write_i32(displacement)
                }
            }
            (_, CilOperand::Switch(labels)) => {
                let base = i64::from(instruction.offset) + i64::from(instruction.size());
                let count = u32::try_from(labels.len())
                    .map_err(|_| invalid("Jump table is too large".to_string()))?;
                writer.write_u32(count)?;
                for label in labels {
                    let displacement = i64::from(self.label_offset(label)?) - base;
                    let displacement = i32::try_from(displacement).map_err(|_| {
                        invalid(format!("Switch displacement {displacement} does not fit 32 bits"))
                    })?;
                    writer.write_i32(displacement)?;
                }
                Ok(())
            }
            (operand_type, CilOperand::Local(local)) => {
                let index = self.operands.variable_index(*local)?;
                write_index(
                    writer,
                    index,
                    operand_type == CilOperandType::ShortInlineVar,
                    &invalid,
                )
            }
            (operand_type, CilOperand::Argument(argument)) => {
                let index = self.operands.argument_index(*argument)?;
                write_index(
                    writer,
                    index,
                    operand_type == CilOperandType::ShortInlineArgument,
                    &invalid,
                )
            }
            (CilOperandType::InlineString, CilOperand::Token(token)) => {
                writer.write_u32(non_null(*token)?.value())
            }
            (_, CilOperand::Token(token)) => {
                let token = self.operands.member_token(non_null(*token)?)?;
                writer.write_u32(non_null(token)?.value())
            }
            (_, CilOperand::String(value)) => {
                let token = self.operands.string_token(value)?;
                writer.write_u32(token.value())
            }
        }
    }

    fn label_offset(&self, label: &CilLabel) -> Result<u32> {
        self.instructions.label_offset(label).ok_or_else(|| {
            Error::InvalidArgument(format!("Label {label} does not refer to an instruction"))
        })
    }
}

fn non_null(token: Token) -> Result<Token> {
    if token.is_null() {
        Err(Error::NullToken(token))
    } else {
        Ok(token)
    }
}

fn write_index(
    writer: &mut dyn BinaryStreamWriter,
    index: u16,
    short: bool,
    invalid: &dyn Fn(String) -> Error,
) -> Result<()> {
    if short {
        let index = u8::try_from(index)
            .map_err(|_| invalid(format!("Index {index} does not fit 8 bits")))?;
        writer.write_u8(index)
    } else {
        writer.write_u16(index)
    }
}

/// Encodes `instructions`, returning the code bytes.
///
/// # Errors
/// See [`CilAssembler::assemble`].
pub fn assemble(
    instructions: &CilInstructionCollection,
    operands: &mut dyn OperandBuilder,
) -> Result<Vec<u8>> {
    CilAssembler::new(instructions, operands).assemble()
}
