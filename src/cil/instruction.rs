use std::fmt;

use widestring::U16String;

use super::{CilCode, CilFlowControl, CilOpCode, CilOperandType};
use crate::{metadata::Token, Error, Result};

/// Stable handle of an instruction inside a [`super::CilInstructionCollection`].
///
/// Handles survive insertions, removals and opcode rewrites, so branch operands and exception
/// handler bounds can refer to instructions without depending on their offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub(crate) usize);

impl InstructionId {
    /// Position of the instruction in the arena of its collection.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A position in a method body used as branch target or exception handler bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CilLabel {
    /// The start of an instruction.
    Instruction(InstructionId),
    /// A raw offset that did not match any instruction when it was read.
    Offset(u32),
    /// The end of the code, one past the last instruction.
    End,
}

impl fmt::Display for CilLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CilLabel::Instruction(id) => write!(f, "{id}"),
            CilLabel::Offset(offset) => write!(f, "IL_{offset:04X}"),
            CilLabel::End => f.write_str("IL_END"),
        }
    }
}

/// Operand of a local variable instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalRef {
    /// A variable declared by the body's local variable signature.
    Variable(u16),
    /// A raw index that could not be matched with a declared variable.
    Index(u16),
}

impl LocalRef {
    /// Encoded index of the variable.
    #[must_use]
    pub fn index(self) -> u16 {
        match self {
            LocalRef::Variable(index) | LocalRef::Index(index) => index,
        }
    }
}

/// Operand of an argument instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentRef {
    /// The implicit `this` argument of an instance method.
    This,
    /// A declared parameter, by position in the method signature.
    Parameter(u16),
    /// A raw index that could not be matched with a parameter.
    Index(u16),
}

impl ArgumentRef {
    /// Encoded argument index. Declared parameters are shifted by one when the method has an
    /// implicit `this` argument.
    #[must_use]
    pub fn index(self, has_this: bool) -> u16 {
        match self {
            ArgumentRef::This => 0,
            ArgumentRef::Parameter(index) => index.saturating_add(u16::from(has_this)),
            ArgumentRef::Index(index) => index,
        }
    }
}

/// Operand of a [`CilInstruction`].
#[derive(Debug, Clone, PartialEq)]
pub enum CilOperand {
    /// No operand.
    None,
    /// 8-bit immediate.
    I8(i8),
    /// 32-bit immediate.
    I32(i32),
    /// 64-bit immediate.
    I64(i64),
    /// 32-bit float immediate.
    F32(f32),
    /// 64-bit float immediate.
    F64(f64),
    /// Branch target.
    Label(CilLabel),
    /// Jump table targets.
    Switch(Vec<CilLabel>),
    /// Local variable.
    Local(LocalRef),
    /// Argument.
    Argument(ArgumentRef),
    /// Metadata member, type or signature token. Also used for string tokens that could not
    /// be resolved.
    Token(Token),
    /// Resolved user string, as stored in `#US`.
    String(U16String),
}

impl CilOperand {
    fn kind(&self) -> &'static str {
        match self {
            CilOperand::None => "none",
            CilOperand::I8(_) => "int8",
            CilOperand::I32(_) => "int32",
            CilOperand::I64(_) => "int64",
            CilOperand::F32(_) => "float32",
            CilOperand::F64(_) => "float64",
            CilOperand::Label(_) => "label",
            CilOperand::Switch(_) => "switch table",
            CilOperand::Local(_) => "local variable",
            CilOperand::Argument(_) => "argument",
            CilOperand::Token(_) => "token",
            CilOperand::String(_) => "string",
        }
    }

    fn fits(&self, operand_type: CilOperandType) -> bool {
        use CilOperandType as T;

        match (operand_type, self) {
            (T::InlineNone, CilOperand::None)
            | (T::ShortInlineI, CilOperand::I8(_))
            | (T::InlineI, CilOperand::I32(_))
            | (T::InlineI8, CilOperand::I64(_))
            | (T::ShortInlineR, CilOperand::F32(_))
            | (T::InlineR, CilOperand::F64(_))
            | (T::ShortInlineBrTarget | T::InlineBrTarget, CilOperand::Label(_))
            | (T::InlineSwitch, CilOperand::Switch(_))
            | (T::ShortInlineVar | T::InlineVar, CilOperand::Local(_))
            | (T::ShortInlineArgument | T::InlineArgument, CilOperand::Argument(_))
            | (T::InlineString, CilOperand::String(_) | CilOperand::Token(_))
            | (
                T::InlineField | T::InlineMethod | T::InlineSig | T::InlineTok | T::InlineType,
                CilOperand::Token(_),
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CilOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CilOperand::None => Ok(()),
            CilOperand::I8(value) => write!(f, "{value}"),
            CilOperand::I32(value) => write!(f, "{value}"),
            CilOperand::I64(value) => write!(f, "{value}"),
            CilOperand::F32(value) => write!(f, "{value}"),
            CilOperand::F64(value) => write!(f, "{value}"),
            CilOperand::Label(label) => write!(f, "{label}"),
            CilOperand::Switch(labels) => {
                f.write_str("(")?;
                for (i, label) in labels.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{label}")?;
                }
                f.write_str(")")
            }
            CilOperand::Local(local) => write!(f, "V_{}", local.index()),
            CilOperand::Argument(ArgumentRef::This) => f.write_str("this"),
            CilOperand::Argument(ArgumentRef::Parameter(index)) => write!(f, "A_{index}"),
            CilOperand::Argument(ArgumentRef::Index(index)) => write!(f, "arg_{index}"),
            CilOperand::Token(token) => write!(f, "{token}"),
            CilOperand::String(value) => write!(f, "{:?}", value.to_string_lossy()),
        }
    }
}

/// A single CIL instruction.
///
/// The opcode and operand are only changed together through [`CilInstruction::set`], which
/// rejects operands that do not match the opcode's operand encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct CilInstruction {
    /// Offset of the instruction relative to the start of the code. Only meaningful after
    /// offsets were calculated.
    pub offset: u32,
    code: CilCode,
    operand: CilOperand,
}

impl CilInstruction {
    /// Creates an instruction at offset 0.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `operand` does not match the operand type of `code`.
    pub fn new(code: CilCode, operand: CilOperand) -> Result<Self> {
        validate(code, &operand)?;
        Ok(CilInstruction {
            offset: 0,
            code,
            operand,
        })
    }

    /// Creates an instruction without operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `code` requires an operand.
    pub fn simple(code: CilCode) -> Result<Self> {
        Self::new(code, CilOperand::None)
    }

    /// Creates the smallest instruction pushing `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        let (code, operand) = ldc_i4_encoding(value);
        CilInstruction {
            offset: 0,
            code,
            operand,
        }
    }

    /// Returns the instruction with its offset set.
    #[must_use]
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// The opcode value.
    #[must_use]
    pub fn code(&self) -> CilCode {
        self.code
    }

    /// The static opcode description.
    #[must_use]
    pub fn opcode(&self) -> &'static CilOpCode {
        self.code.op_code()
    }

    /// The operand.
    #[must_use]
    pub fn operand(&self) -> &CilOperand {
        &self.operand
    }

    /// Replaces opcode and operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `operand` does not match `code`. The instruction is
    /// left unchanged in that case.
    pub fn set(&mut self, code: CilCode, operand: CilOperand) -> Result<()> {
        validate(code, &operand)?;
        self.code = code;
        self.operand = operand;
        Ok(())
    }

    /// Replaces the operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `operand` does not match the current opcode.
    pub fn set_operand(&mut self, operand: CilOperand) -> Result<()> {
        self.set(self.code, operand)
    }

    /// Replaces the opcode, keeping the operand. Only valid between opcodes with compatible
    /// operand encodings.
    pub(crate) fn set_code_unchecked(&mut self, code: CilCode) {
        self.code = code;
    }

    /// Encoded size of the instruction in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        let opcode = self.opcode();
        let operand = match (&self.operand, opcode.operand_type) {
            (CilOperand::Switch(labels), CilOperandType::InlineSwitch) => {
                #[allow(clippy::cast_possible_truncation)]
                let count = labels.len() as u32;
                4 + 4 * count
            }
            (_, operand_type) => operand_type.fixed_size(),
        };
        opcode.size() + operand
    }

    /// Returns `true` for instructions with a single branch target.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.opcode().operand_type,
            CilOperandType::InlineBrTarget | CilOperandType::ShortInlineBrTarget
        )
    }

    /// Returns `true` for unconditional branches.
    #[must_use]
    pub fn is_unconditional_branch(&self) -> bool {
        self.is_branch() && self.opcode().flow_control == CilFlowControl::Branch
    }

    /// Returns `true` for `ldc.i4` in any encoding.
    #[must_use]
    pub fn is_ldc_i4(&self) -> bool {
        self.ldc_i4_constant().is_some()
    }

    /// Returns `true` for `ldloc` in any encoding.
    #[must_use]
    pub fn is_ldloc(&self) -> bool {
        matches!(
            self.code,
            CilCode::Ldloc0
                | CilCode::Ldloc1
                | CilCode::Ldloc2
                | CilCode::Ldloc3
                | CilCode::LdlocS
                | CilCode::Ldloc
        )
    }

    /// Returns `true` for `stloc` in any encoding.
    #[must_use]
    pub fn is_stloc(&self) -> bool {
        matches!(
            self.code,
            CilCode::Stloc0
                | CilCode::Stloc1
                | CilCode::Stloc2
                | CilCode::Stloc3
                | CilCode::StlocS
                | CilCode::Stloc
        )
    }

    /// Returns `true` for `ldarg` in any encoding.
    #[must_use]
    pub fn is_ldarg(&self) -> bool {
        matches!(
            self.code,
            CilCode::Ldarg0
                | CilCode::Ldarg1
                | CilCode::Ldarg2
                | CilCode::Ldarg3
                | CilCode::LdargS
                | CilCode::Ldarg
        )
    }

    /// Returns `true` for `starg` in any encoding.
    #[must_use]
    pub fn is_starg(&self) -> bool {
        matches!(self.code, CilCode::StargS | CilCode::Starg)
    }

    /// The constant pushed by an `ldc.i4` instruction in any encoding.
    #[must_use]
    pub fn ldc_i4_constant(&self) -> Option<i32> {
        match self.code {
            CilCode::LdcI4M1 => Some(-1),
            CilCode::LdcI40 => Some(0),
            CilCode::LdcI41 => Some(1),
            CilCode::LdcI42 => Some(2),
            CilCode::LdcI43 => Some(3),
            CilCode::LdcI44 => Some(4),
            CilCode::LdcI45 => Some(5),
            CilCode::LdcI46 => Some(6),
            CilCode::LdcI47 => Some(7),
            CilCode::LdcI48 => Some(8),
            CilCode::LdcI4S | CilCode::LdcI4 => match self.operand {
                CilOperand::I8(value) => Some(i32::from(value)),
                CilOperand::I32(value) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// The local variable index referenced by a local variable instruction in any encoding.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match self.code {
            CilCode::Ldloc0 | CilCode::Stloc0 => Some(0),
            CilCode::Ldloc1 | CilCode::Stloc1 => Some(1),
            CilCode::Ldloc2 | CilCode::Stloc2 => Some(2),
            CilCode::Ldloc3 | CilCode::Stloc3 => Some(3),
            _ => match self.operand {
                CilOperand::Local(local) => Some(local.index()),
                _ => None,
            },
        }
    }

    /// The argument index referenced by an argument instruction in any encoding.
    #[must_use]
    pub fn argument_index(&self, has_this: bool) -> Option<u16> {
        match self.code {
            CilCode::Ldarg0 => Some(0),
            CilCode::Ldarg1 => Some(1),
            CilCode::Ldarg2 => Some(2),
            CilCode::Ldarg3 => Some(3),
            _ => match self.operand {
                CilOperand::Argument(argument) => Some(argument.index(has_this)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for CilInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X}: {}", self.offset, self.opcode().mnemonic)?;
        if self.operand != CilOperand::None {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

/// Smallest opcode and operand pushing `value`.
#[must_use]
pub fn ldc_i4_encoding(value: i32) -> (CilCode, CilOperand) {
    match value {
        -1 => (CilCode::LdcI4M1, CilOperand::None),
        0 => (CilCode::LdcI40, CilOperand::None),
        1 => (CilCode::LdcI41, CilOperand::None),
        2 => (CilCode::LdcI42, CilOperand::None),
        3 => (CilCode::LdcI43, CilOperand::None),
        4 => (CilCode::LdcI44, CilOperand::None),
        5 => (CilCode::LdcI45, CilOperand::None),
        6 => (CilCode::LdcI46, CilOperand::None),
        7 => (CilCode::LdcI47, CilOperand::None),
        8 => (CilCode::LdcI48, CilOperand::None),
        _ => match i8::try_from(value) {
            Ok(short) => (CilCode::LdcI4S, CilOperand::I8(short)),
            Err(_) => (CilCode::LdcI4, CilOperand::I32(value)),
        },
    }
}

fn validate(code: CilCode, operand: &CilOperand) -> Result<()> {
    let opcode = code.op_code();
    if opcode.operand_type == CilOperandType::InlinePhi || !operand.fits(opcode.operand_type) {
        return Err(Error::InvalidOperand {
            mnemonic: opcode.mnemonic,
            message: format!(
                "{} operand given for operand type {:?}",
                operand.kind(),
                opcode.operand_type
            ),
        });
    }
    Ok(())
}
