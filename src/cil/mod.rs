//! CIL method bodies.
//!
//! The module works on two levels:
//!
//! - **Raw bodies** ([`CilRawMethodBody`]) keep the encoded header, code bytes and extra
//!   sections exactly as stored in the image. They are segments and can be written back
//!   without touching the code.
//! - **Structured bodies** ([`CilMethodBody`]) hold an instruction arena
//!   ([`CilInstructionCollection`]) and exception handlers whose bounds refer to instructions.
//!   Both lists are decoded on first access.
//!
//! Branch targets and handler bounds are [`CilLabel`] values naming an [`InstructionId`], so
//! instructions can be inserted and removed without invalidating them. Offsets are only
//! updated by [`CilInstructionCollection::calculate_offsets`], which must run before a body
//! is assembled.
//!
//! Metadata references are resolved through an [`OperandResolver`] when reading and encoded
//! through an [`OperandBuilder`] when writing.
//!
//! # Examples
//!
//! ```rust
//! use peweave::cil::{
//!     CilCode, CilInstruction, CilLabel, CilMethodBody, CilOperand, DefaultOperandBuilder,
//! };
//!
//! let mut body = CilMethodBody::new(false);
//! let instructions = body.instructions_mut()?;
//! let ret = instructions.push(CilInstruction::simple(CilCode::Ret)?);
//! instructions.insert(
//!     0,
//!     CilInstruction::new(CilCode::Br, CilOperand::Label(CilLabel::Instruction(ret)))?,
//! )?;
//! instructions.calculate_offsets();
//! instructions.optimize_macros();
//! assert_eq!(instructions.at(0).map(CilInstruction::code), Some(CilCode::BrS));
//!
//! let raw = body.to_raw(&mut DefaultOperandBuilder::default())?;
//! assert_eq!(raw.code(), &[0x2B, 0x00, 0x2A]);
//! # Ok::<(), peweave::Error>(())
//! ```

mod assembler;
mod body;
mod collection;
mod disassembler;
pub mod handler;
mod instruction;
mod opcode;
pub mod raw;
mod reassembler;
mod resolver;

pub use assembler::{assemble, CilAssembler};
pub use body::CilMethodBody;
pub use collection::CilInstructionCollection;
pub use disassembler::{decode_instruction, decode_stream, disassemble};
pub use handler::{
    is_fat_format_required, CilExceptionHandler, CilExceptionHandlerType, CilRawExceptionHandler,
};
pub use instruction::{
    ldc_i4_encoding, ArgumentRef, CilInstruction, CilLabel, CilOperand, InstructionId, LocalRef,
};
pub use opcode::{
    CilCode, CilFlowControl, CilOpCode, CilOpCodeType, CilOperandType, CilStackBehaviour,
};
pub use raw::{
    CilExtraSection, CilExtraSectionAttributes, CilMethodBodyAttributes, CilRawFatMethodBody,
    CilRawMethodBody, CilRawTinyMethodBody,
};
pub use reassembler::{rewrite_body, rewrite_code, rewrite_exception_handlers};
pub use resolver::{
    DefaultOperandBuilder, MetadataOperandResolver, MethodSignatureInfo, OperandBuilder,
    OperandResolver, SignatureOperandResolver,
};
