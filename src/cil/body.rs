//! Structured method bodies.
//!
//! A [`CilMethodBody`] read from an image keeps the raw code and clauses and decodes them on
//! first access: instructions through [`disassemble`], exception handlers by mapping clause
//! offsets to instruction labels. Both lists are materialized independently. Decoding is
//! deterministic, so the handler labels refer to the same instructions as the instruction list
//! even when that list is decoded later.
//!
//! ```rust
//! use peweave::cil::{CilCode, CilInstruction, CilMethodBody, DefaultOperandBuilder};
//! use peweave::segment::Segment;
//!
//! let mut body = CilMethodBody::new(true);
//! let instructions = body.instructions_mut()?;
//! instructions.push(CilInstruction::simple(CilCode::Ldarg0)?);
//! instructions.push(CilInstruction::simple(CilCode::Ret)?);
//! instructions.calculate_offsets();
//!
//! let raw = body.to_raw(&mut DefaultOperandBuilder::new(true))?;
//! assert_eq!(raw.to_bytes()?, vec![0x0A, 0x02, 0x2A]);
//! # Ok::<(), peweave::Error>(())
//! ```

use std::sync::Arc;

use super::{
    assemble, decode_stream,
    handler::{CilExceptionHandler, CilExceptionHandlerType, CilRawExceptionHandler},
    raw::{
        CilExtraSection, CilMethodBodyAttributes, CilRawFatMethodBody, CilRawMethodBody,
        CilRawTinyMethodBody,
    },
    disassemble, CilInstructionCollection, CilLabel, InstructionId, OperandBuilder,
    OperandResolver,
};
use crate::{
    io::BinaryStreamReader,
    lazy::{LazyList, LazyVariable},
    metadata::Token,
    utils::to_u32,
    Error, Result,
};

/// Largest stack depth a tiny body implies.
pub const TINY_MAX_STACK: u16 = 8;
/// Code size from which a fat header is required.
pub const FAT_CODE_SIZE: u32 = 64;

/// A method body with decoded instructions and exception handlers.
pub struct CilMethodBody {
    /// Maximum evaluation stack depth.
    pub max_stack: u16,
    /// Zero-initialize locals.
    pub init_locals: bool,
    /// Local variable signature, or [`Token::NULL`].
    pub local_var_sig_token: Token,
    instructions: LazyVariable<CilInstructionCollection>,
    exception_handlers: LazyList<CilExceptionHandler>,
}

impl CilMethodBody {
    /// Creates an empty body.
    #[must_use]
    pub fn new(has_this: bool) -> Self {
        CilMethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: false,
            local_var_sig_token: Token::NULL,
            instructions: LazyVariable::new(CilInstructionCollection::new(has_this)),
            exception_handlers: LazyList::new(),
        }
    }

    /// Creates a body decoding `raw` on demand.
    ///
    /// # Errors
    /// Returns an error if the exception handler sections are malformed.
    pub fn from_raw(
        raw: &CilRawMethodBody,
        resolver: Arc<dyn OperandResolver>,
        has_this: bool,
    ) -> Result<Self> {
        let (init_locals, clauses) = match raw {
            CilRawMethodBody::Tiny(_) => (false, Vec::new()),
            CilRawMethodBody::Fat(fat) => (fat.init_locals(), fat.exception_handlers()?),
        };
        let code: Arc<[u8]> = raw.code().into();

        let instructions = {
            let code = code.clone();
            LazyVariable::with_factory(move || disassemble(&code, resolver.as_ref(), has_this))
        };

        let exception_handlers = if clauses.is_empty() {
            LazyList::new()
        } else {
            LazyList::with_factory(move || {
                let offsets = instruction_offsets(&code)?;
                let end = to_u32(code.len())?;
                Ok(clauses
                    .iter()
                    .map(|clause| map_clause(clause, &offsets, end))
                    .collect())
            })
        };

        Ok(CilMethodBody {
            max_stack: raw.max_stack(),
            init_locals,
            local_var_sig_token: raw.local_var_sig_token(),
            instructions,
            exception_handlers,
        })
    }

    /// Reads a raw body at the reader's position and wraps it.
    ///
    /// # Errors
    /// See [`CilRawMethodBody::from_reader`] and [`CilMethodBody::from_raw`].
    pub fn from_reader(
        reader: &mut BinaryStreamReader,
        resolver: Arc<dyn OperandResolver>,
        has_this: bool,
    ) -> Result<Self> {
        let raw = CilRawMethodBody::from_reader(reader)?;
        Self::from_raw(&raw, resolver, has_this)
    }

    /// The instructions, decoded on first access.
    ///
    /// # Errors
    /// Returns an error if the code cannot be decoded.
    pub fn instructions(&self) -> Result<&CilInstructionCollection> {
        self.instructions.get()
    }

    /// Mutable access to the instructions.
    ///
    /// # Errors
    /// Returns an error if the code cannot be decoded.
    pub fn instructions_mut(&mut self) -> Result<&mut CilInstructionCollection> {
        self.instructions.get_mut()
    }

    /// The exception handlers, decoded on first access.
    ///
    /// # Errors
    /// Returns an error if the code cannot be decoded.
    pub fn exception_handlers(&self) -> Result<&[CilExceptionHandler]> {
        self.exception_handlers.items()
    }

    /// Mutable access to the exception handlers.
    ///
    /// # Errors
    /// Returns an error if the code cannot be decoded.
    pub fn exception_handlers_mut(&mut self) -> Result<&mut Vec<CilExceptionHandler>> {
        self.exception_handlers.items_mut()
    }

    /// Returns `true` if the body needs a fat header: it has exception handlers or locals, a
    /// stack deeper than 8, or at least 64 bytes of code.
    ///
    /// # Errors
    /// Returns an error if the instructions or handlers cannot be decoded.
    pub fn is_fat(&self) -> Result<bool> {
        Ok(!self.exception_handlers()?.is_empty()
            || !self.local_var_sig_token.is_null()
            || self.max_stack > TINY_MAX_STACK
            || self.instructions()?.size() >= FAT_CODE_SIZE)
    }

    /// Checks that branch targets and handler bounds all refer to instructions of the body.
    /// Offsets must be current.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for the first missing label.
    pub fn verify_labels(&self) -> Result<()> {
        let instructions = self.instructions()?;
        instructions.verify_labels()?;

        for (index, handler) in self.exception_handlers()?.iter().enumerate() {
            let mut bounds = vec![
                ("try start", handler.try_start),
                ("try end", handler.try_end),
                ("handler start", handler.handler_start),
                ("handler end", handler.handler_end),
            ];
            if handler.handler_type == CilExceptionHandlerType::Filter {
                bounds.push(("filter start", handler.filter_start));
            }

            for (name, label) in bounds {
                let present = label
                    .as_ref()
                    .is_some_and(|label| instructions.is_label_present(label));
                if !present {
                    return Err(Error::InvalidArgument(format!(
                        "Exception handler {index} has no valid {name}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serializes the body with its current offsets.
    ///
    /// Instructions are not re-laid out; call
    /// [`CilInstructionCollection::calculate_offsets`] after editing them.
    ///
    /// # Errors
    /// Returns an error for missing labels, operands that do not fit their encoding and null
    /// member tokens.
    pub fn to_raw(&self, operands: &mut dyn OperandBuilder) -> Result<CilRawMethodBody> {
        self.verify_labels()?;

        let instructions = self.instructions()?;
        let code = assemble(instructions, operands)?;

        if !self.is_fat()? {
            return Ok(CilRawMethodBody::Tiny(CilRawTinyMethodBody::new(code)?));
        }

        let mut attributes = CilMethodBodyAttributes::FAT;
        if self.init_locals {
            attributes |= CilMethodBodyAttributes::INIT_LOCALS;
        }
        let mut fat =
            CilRawFatMethodBody::new(attributes, self.max_stack, self.local_var_sig_token, code);

        let handlers = self.exception_handlers()?;
        if !handlers.is_empty() {
            let clauses = handlers
                .iter()
                .map(|handler| raw_clause(handler, instructions, operands))
                .collect::<Result<Vec<_>>>()?;
            fat.extra_sections.push(CilExtraSection::from_handlers(&clauses)?);
        }

        Ok(CilRawMethodBody::Fat(fat))
    }
}

impl std::fmt::Debug for CilMethodBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CilMethodBody")
            .field("max_stack", &self.max_stack)
            .field("init_locals", &self.init_locals)
            .field("local_var_sig_token", &self.local_var_sig_token)
            .field("instructions", &self.instructions)
            .field("exception_handlers", &self.exception_handlers)
            .finish()
    }
}

fn instruction_offsets(code: &[u8]) -> Result<Vec<u32>> {
    let mut reader = BinaryStreamReader::from_bytes(code.to_vec());
    Ok(decode_stream(&mut reader)?
        .iter()
        .map(|instruction| instruction.offset)
        .collect())
}

fn label_for(offset: u32, offsets: &[u32], end: u32) -> CilLabel {
    match offsets.binary_search(&offset) {
        Ok(index) => CilLabel::Instruction(InstructionId(index)),
        Err(_) if offset == end => CilLabel::End,
        Err(_) => CilLabel::Offset(offset),
    }
}

fn map_clause(clause: &CilRawExceptionHandler, offsets: &[u32], end: u32) -> CilExceptionHandler {
    let label = |offset: u32| Some(label_for(offset, offsets, end));

    let mut handler = CilExceptionHandler::new(clause.handler_type);
    handler.try_start = label(clause.try_offset);
    handler.try_end = label(clause.try_offset + clause.try_length);
    handler.handler_start = label(clause.handler_offset);
    handler.handler_end = label(clause.handler_offset + clause.handler_length);
    match clause.handler_type {
        CilExceptionHandlerType::Exception => {
            handler.exception_type = Some(Token::new(clause.extra));
        }
        CilExceptionHandlerType::Filter => handler.filter_start = label(clause.extra),
        CilExceptionHandlerType::Finally | CilExceptionHandlerType::Fault => {}
    }
    handler
}

fn raw_clause(
    handler: &CilExceptionHandler,
    instructions: &CilInstructionCollection,
    operands: &mut dyn OperandBuilder,
) -> Result<CilRawExceptionHandler> {
    let offset = |label: Option<CilLabel>| -> Result<u32> {
        label
            .and_then(|label| instructions.label_offset(&label))
            .ok_or_else(|| Error::InvalidArgument("Exception handler bound is not set".to_string()))
    };

    let try_offset = offset(handler.try_start)?;
    let handler_offset = offset(handler.handler_start)?;
    let extra = match handler.handler_type {
        CilExceptionHandlerType::Exception => match handler.exception_type {
            Some(token) if !token.is_null() => operands.member_token(token)?.value(),
            Some(token) => return Err(Error::NullToken(token)),
            None => return Err(Error::NullToken(Token::NULL)),
        },
        CilExceptionHandlerType::Filter => offset(handler.filter_start)?,
        CilExceptionHandlerType::Finally | CilExceptionHandlerType::Fault => 0,
    };

    Ok(CilRawExceptionHandler {
        handler_type: handler.handler_type,
        try_offset,
        try_length: offset(handler.try_end)?.saturating_sub(try_offset),
        handler_offset,
        handler_length: offset(handler.handler_end)?.saturating_sub(handler_offset),
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cil::{
            ArgumentRef, CilCode, CilInstruction, CilOperand, DefaultOperandBuilder,
            MethodSignatureInfo, SignatureOperandResolver,
        },
        segment::Segment,
    };

    fn resolver(locals: Option<u16>) -> Arc<dyn OperandResolver> {
        Arc::new(SignatureOperandResolver::new(MethodSignatureInfo {
            has_this: true,
            parameter_count: 1,
            locals_count: locals,
        }))
    }

    #[test]
    fn tiny_body_round_trip() {
        let mut reader = BinaryStreamReader::from_bytes(vec![0x0A, 0x02, 0x2A]);
        let body = CilMethodBody::from_reader(&mut reader, resolver(None), true).unwrap();
        assert_eq!(body.max_stack, 8);
        assert!(!body.is_fat().unwrap());

        let instructions = body.instructions().unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions.at(0).unwrap().code(), CilCode::Ldarg0);

        let raw = body.to_raw(&mut DefaultOperandBuilder::new(true)).unwrap();
        assert_eq!(raw.to_bytes().unwrap(), vec![0x0A, 0x02, 0x2A]);
    }

    #[test]
    fn fat_body_with_one_local() {
        let mut body = CilMethodBody::new(false);
        body.max_stack = 1;
        body.local_var_sig_token = Token::new(0x1100_0001);
        {
            let instructions = body.instructions_mut().unwrap();
            instructions.push(CilInstruction::ldc_i4(1000));
            instructions.push(CilInstruction::simple(CilCode::Stloc0).unwrap());
            instructions.push(CilInstruction::simple(CilCode::Ldloc0).unwrap());
            instructions.push(CilInstruction::simple(CilCode::Pop).unwrap());
            instructions.push(CilInstruction::simple(CilCode::Nop).unwrap());
            instructions.push(CilInstruction::simple(CilCode::Ret).unwrap());
            instructions.calculate_offsets();
            assert_eq!(instructions.size(), 10);
        }
        assert!(body.is_fat().unwrap());

        let raw = body.to_raw(&mut DefaultOperandBuilder::default()).unwrap();
        let bytes = raw.to_bytes().unwrap();
        assert_eq!(bytes.len(), 22);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]) & 0x0FFF, 0x3003);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 1);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 10);
        assert_ne!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0);
    }

    fn protected_body() -> Vec<u8> {
        // try { nop; leave.s ret } finally { endfinally } ret
        let code = [0x00, 0xDE, 0x01, 0xDC, 0x2A];
        let clause = CilRawExceptionHandler {
            handler_type: CilExceptionHandlerType::Finally,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 1,
            extra: 0,
        };
        let mut fat = CilRawFatMethodBody::new(
            CilMethodBodyAttributes::FAT,
            1,
            Token::NULL,
            code.to_vec(),
        );
        fat.extra_sections
            .push(CilExtraSection::from_handlers(&[clause]).unwrap());
        CilRawMethodBody::Fat(fat).to_bytes().unwrap()
    }

    #[test]
    fn handlers_are_mapped_to_instructions() {
        let bytes = protected_body();
        let mut reader = BinaryStreamReader::from_bytes(bytes.clone());
        let body = CilMethodBody::from_reader(&mut reader, resolver(None), false).unwrap();

        // Handlers first, then instructions: both refer to the same ids.
        let handler = body.exception_handlers().unwrap()[0].clone();
        let instructions = body.instructions().unwrap();
        assert_eq!(
            handler.try_start,
            Some(CilLabel::Instruction(instructions.id_at(0).unwrap()))
        );
        assert_eq!(
            handler.handler_start,
            Some(CilLabel::Instruction(instructions.id_at(2).unwrap()))
        );
        assert_eq!(
            handler.handler_end,
            Some(CilLabel::Instruction(instructions.id_at(3).unwrap()))
        );

        let raw = body.to_raw(&mut DefaultOperandBuilder::default()).unwrap();
        assert_eq!(raw.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn edits_keep_handler_bounds() {
        let mut reader = BinaryStreamReader::from_bytes(protected_body());
        let mut body = CilMethodBody::from_reader(&mut reader, resolver(None), false).unwrap();
        {
            let instructions = body.instructions_mut().unwrap();
            for _ in 0..300 {
                instructions
                    .insert(1, CilInstruction::simple(CilCode::Nop).unwrap())
                    .unwrap();
            }
            instructions.optimize_macros();
        }

        let raw = body.to_raw(&mut DefaultOperandBuilder::default()).unwrap();
        let CilRawMethodBody::Fat(fat) = raw else {
            panic!("expected a fat body");
        };
        let clauses = fat.exception_handlers().unwrap();
        assert!(fat.extra_sections[0].is_fat());
        assert_eq!(clauses[0].try_length, 303);
        assert_eq!(clauses[0].handler_offset, 303);
    }

    #[test]
    fn missing_handler_bound() {
        let mut body = CilMethodBody::new(false);
        body.instructions_mut()
            .unwrap()
            .push(CilInstruction::simple(CilCode::Ret).unwrap());
        body.exception_handlers_mut()
            .unwrap()
            .push(CilExceptionHandler::new(CilExceptionHandlerType::Fault));
        assert!(body.verify_labels().is_err());
        assert!(body.to_raw(&mut DefaultOperandBuilder::default()).is_err());
    }

    #[test]
    fn typed_clause_needs_a_type() {
        let mut body = CilMethodBody::new(false);
        let (start, end) = {
            let instructions = body.instructions_mut().unwrap();
            let start = instructions.push(CilInstruction::simple(CilCode::Nop).unwrap());
            let end = instructions.push(CilInstruction::simple(CilCode::Ret).unwrap());
            instructions.calculate_offsets();
            (start, end)
        };

        let mut handler = CilExceptionHandler::new(CilExceptionHandlerType::Exception);
        handler.try_start = Some(CilLabel::Instruction(start));
        handler.try_end = Some(CilLabel::Instruction(end));
        handler.handler_start = Some(CilLabel::Instruction(end));
        handler.handler_end = Some(CilLabel::End);
        body.exception_handlers_mut().unwrap().push(handler);

        let error = body.to_raw(&mut DefaultOperandBuilder::default()).unwrap_err();
        assert!(matches!(error, Error::NullToken(_)));
    }

    #[test]
    fn arguments_resolve_through_signature() {
        // ldarg.1; ret
        let mut reader = BinaryStreamReader::from_bytes(vec![0x0A, 0x03, 0x2A]);
        let mut body = CilMethodBody::from_reader(&mut reader, resolver(None), true).unwrap();
        let instructions = body.instructions_mut().unwrap();
        instructions.expand_macros();
        instructions.calculate_offsets();
        assert_eq!(
            instructions.at(0).unwrap().operand(),
            &CilOperand::Argument(ArgumentRef::Index(1))
        );
        instructions.optimize_macros();
        assert_eq!(instructions.at(0).unwrap().code(), CilCode::Ldarg1);
    }
}
