//! The CIL instruction set.
//!
//! Every opcode of ECMA-335 Partition III is described by a static [`CilOpCode`] entry carrying
//! its mnemonic, operand encoding, flow control class, opcode class and stack transition. The
//! entries are looked up through [`CilCode`], whose discriminant is the encoded opcode value
//! (`0xFExx` for two-byte opcodes).
//!
//! # Examples
//!
//! ```rust
//! use peweave::cil::{CilCode, CilFlowControl, CilOperandType};
//!
//! let opcode = CilCode::BrS.op_code();
//! assert_eq!(opcode.mnemonic, "br.s");
//! assert_eq!(opcode.operand_type, CilOperandType::ShortInlineBrTarget);
//! assert_eq!(opcode.flow_control, CilFlowControl::Branch);
//! assert_eq!(opcode.size(), 1);
//!
//! assert_eq!(CilCode::from_bytes(0xFE, Some(0x01)), Some(CilCode::Ceq));
//! ```

use std::fmt;

use strum::{EnumCount, EnumIter, FromRepr};

/// How an opcode encodes its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CilOperandType {
    /// No operand.
    InlineNone,
    /// Signed 8-bit immediate.
    ShortInlineI,
    /// Signed 32-bit immediate.
    InlineI,
    /// Signed 64-bit immediate.
    InlineI8,
    /// 32-bit floating point immediate.
    ShortInlineR,
    /// 64-bit floating point immediate.
    InlineR,
    /// Signed 8-bit branch displacement.
    ShortInlineBrTarget,
    /// Signed 32-bit branch displacement.
    InlineBrTarget,
    /// Jump table: a 32-bit count followed by 32-bit displacements.
    InlineSwitch,
    /// 8-bit local variable index.
    ShortInlineVar,
    /// 16-bit local variable index.
    InlineVar,
    /// 8-bit argument index.
    ShortInlineArgument,
    /// 16-bit argument index.
    InlineArgument,
    /// Field token.
    InlineField,
    /// Method token.
    InlineMethod,
    /// Stand-alone signature token.
    InlineSig,
    /// User string token.
    InlineString,
    /// Type, method or field token.
    InlineTok,
    /// Type token.
    InlineType,
    /// Reserved phi node encoding. Never emitted by compilers.
    InlinePhi,
}

impl CilOperandType {
    /// Encoded size of an operand of this type. The switch table size depends on its entry
    /// count and is reported as its 4-byte count prefix only.
    #[must_use]
    pub fn fixed_size(self) -> u32 {
        match self {
            CilOperandType::InlineNone | CilOperandType::InlinePhi => 0,
            CilOperandType::ShortInlineI
            | CilOperandType::ShortInlineBrTarget
            | CilOperandType::ShortInlineVar
            | CilOperandType::ShortInlineArgument => 1,
            CilOperandType::InlineVar | CilOperandType::InlineArgument => 2,
            CilOperandType::InlineI8 | CilOperandType::InlineR => 8,
            _ => 4,
        }
    }

    /// Returns `true` for operands holding a metadata token.
    #[must_use]
    pub fn is_token(self) -> bool {
        matches!(
            self,
            CilOperandType::InlineField
                | CilOperandType::InlineMethod
                | CilOperandType::InlineSig
                | CilOperandType::InlineString
                | CilOperandType::InlineTok
                | CilOperandType::InlineType
        )
    }
}

/// How an opcode affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CilFlowControl {
    /// Unconditional branch.
    Branch,
    /// Debugger break.
    Break,
    /// Method call.
    Call,
    /// Conditional branch.
    CondBranch,
    /// Prefix applying to the next instruction.
    Meta,
    /// Falls through to the next instruction.
    Next,
    /// Reserved.
    Phi,
    /// Leaves the method or a protected region.
    Return,
    /// Raises an exception.
    Throw,
}

/// Classification of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CilOpCodeType {
    /// Reserved.
    Annotation,
    /// Compact alias of a more general instruction.
    Macro,
    /// Reserved internal instruction.
    Internal,
    /// Object model instruction.
    ObjModel,
    /// Prefix instruction.
    Prefix,
    /// Basic instruction.
    Primitive,
}

/// Stack transition of an opcode, split into a pop and a push component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CilStackBehaviour {
    Pop0,
    Pop1,
    Pop1Pop1,
    PopI,
    PopIPop1,
    PopIPopI,
    PopIPopI8,
    PopIPopIPopI,
    PopIPopR4,
    PopIPopR8,
    PopRef,
    PopRefPop1,
    PopRefPopI,
    PopRefPopIPopI,
    PopRefPopIPopI8,
    PopRefPopIPopR4,
    PopRefPopIPopR8,
    PopRefPopIPopRef,
    PopRefPopIPop1,
    PopAll,
    Push0,
    Push1,
    Push1Push1,
    PushI,
    PushI8,
    PushR4,
    PushR8,
    PushRef,
    VarPop,
    VarPush,
}

impl CilStackBehaviour {
    /// Number of slots this behaviour pops or pushes. `None` for variable behaviours.
    #[must_use]
    pub fn slots(self) -> Option<u32> {
        use CilStackBehaviour as S;
        match self {
            S::Pop0 | S::Push0 => Some(0),
            S::Pop1 | S::PopI | S::PopRef | S::Push1 | S::PushI | S::PushI8 | S::PushR4
            | S::PushR8 | S::PushRef => Some(1),
            S::Pop1Pop1
            | S::PopIPop1
            | S::PopIPopI
            | S::PopIPopI8
            | S::PopIPopR4
            | S::PopIPopR8
            | S::PopRefPop1
            | S::PopRefPopI
            | S::Push1Push1 => Some(2),
            S::PopIPopIPopI
            | S::PopRefPopIPopI
            | S::PopRefPopIPopI8
            | S::PopRefPopIPopR4
            | S::PopRefPopIPopR8
            | S::PopRefPopIPopRef
            | S::PopRefPopIPop1 => Some(3),
            S::PopAll | S::VarPop | S::VarPush => None,
        }
    }
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CilOpCode {
    /// The opcode value.
    pub code: CilCode,
    /// Assembler mnemonic.
    pub mnemonic: &'static str,
    /// Operand encoding.
    pub operand_type: CilOperandType,
    /// Control flow class.
    pub flow_control: CilFlowControl,
    /// Opcode class.
    pub opcode_type: CilOpCodeType,
    /// Values popped from the evaluation stack.
    pub stack_pop: CilStackBehaviour,
    /// Values pushed onto the evaluation stack.
    pub stack_push: CilStackBehaviour,
}

impl CilOpCode {
    /// Returns `true` for opcodes encoded with the `0xFE` escape byte.
    #[must_use]
    pub fn is_large(&self) -> bool {
        (self.code as u16) > 0xFF
    }

    /// Encoded size of the opcode itself.
    #[must_use]
    pub fn size(&self) -> u32 {
        if self.is_large() {
            2
        } else {
            1
        }
    }

    /// First encoded byte.
    #[must_use]
    pub fn byte1(&self) -> u8 {
        if self.is_large() {
            0xFE
        } else {
            (self.code as u16 & 0xFF) as u8
        }
    }

    /// Second encoded byte of a two-byte opcode.
    #[must_use]
    pub fn byte2(&self) -> Option<u8> {
        self.is_large().then_some((self.code as u16 & 0xFF) as u8)
    }
}

impl fmt::Display for CilOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic)
    }
}

macro_rules! opcodes {
    ($($variant:ident = $value:literal, $mnemonic:literal, $operand:ident, $flow:ident, $kind:ident, $pop:ident, $push:ident;)*) => {
        /// All opcodes of the CIL instruction set. The discriminant is the encoded value.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount, FromRepr)]
        #[repr(u16)]
        #[allow(missing_docs)]
        pub enum CilCode {
            $($variant = $value,)*
        }

        impl CilCode {
            /// The static description of this opcode.
            #[must_use]
            pub fn op_code(self) -> &'static CilOpCode {
                match self {
                    $(CilCode::$variant => &CilOpCode {
                        code: CilCode::$variant,
                        mnemonic: $mnemonic,
                        operand_type: CilOperandType::$operand,
                        flow_control: CilFlowControl::$flow,
                        opcode_type: CilOpCodeType::$kind,
                        stack_pop: CilStackBehaviour::$pop,
                        stack_push: CilStackBehaviour::$push,
                    },)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", InlineNone, Next, Primitive, Pop0, Push0;
    Break = 0x01, "break", InlineNone, Break, Primitive, Pop0, Push0;
    Ldarg0 = 0x02, "ldarg.0", InlineNone, Next, Macro, Pop0, Push1;
    Ldarg1 = 0x03, "ldarg.1", InlineNone, Next, Macro, Pop0, Push1;
    Ldarg2 = 0x04, "ldarg.2", InlineNone, Next, Macro, Pop0, Push1;
    Ldarg3 = 0x05, "ldarg.3", InlineNone, Next, Macro, Pop0, Push1;
    Ldloc0 = 0x06, "ldloc.0", InlineNone, Next, Macro, Pop0, Push1;
    Ldloc1 = 0x07, "ldloc.1", InlineNone, Next, Macro, Pop0, Push1;
    Ldloc2 = 0x08, "ldloc.2", InlineNone, Next, Macro, Pop0, Push1;
    Ldloc3 = 0x09, "ldloc.3", InlineNone, Next, Macro, Pop0, Push1;
    Stloc0 = 0x0A, "stloc.0", InlineNone, Next, Macro, Pop1, Push0;
    Stloc1 = 0x0B, "stloc.1", InlineNone, Next, Macro, Pop1, Push0;
    Stloc2 = 0x0C, "stloc.2", InlineNone, Next, Macro, Pop1, Push0;
    Stloc3 = 0x0D, "stloc.3", InlineNone, Next, Macro, Pop1, Push0;
    LdargS = 0x0E, "ldarg.s", ShortInlineArgument, Next, Macro, Pop0, Push1;
    LdargaS = 0x0F, "ldarga.s", ShortInlineArgument, Next, Macro, Pop0, PushI;
    StargS = 0x10, "starg.s", ShortInlineArgument, Next, Macro, Pop1, Push0;
    LdlocS = 0x11, "ldloc.s", ShortInlineVar, Next, Macro, Pop0, Push1;
    LdlocaS = 0x12, "ldloca.s", ShortInlineVar, Next, Macro, Pop0, PushI;
    StlocS = 0x13, "stloc.s", ShortInlineVar, Next, Macro, Pop1, Push0;
    Ldnull = 0x14, "ldnull", InlineNone, Next, Primitive, Pop0, PushRef;
    LdcI4M1 = 0x15, "ldc.i4.m1", InlineNone, Next, Macro, Pop0, PushI;
    LdcI40 = 0x16, "ldc.i4.0", InlineNone, Next, Macro, Pop0, PushI;
    LdcI41 = 0x17, "ldc.i4.1", InlineNone, Next, Macro, Pop0, PushI;
    LdcI42 = 0x18, "ldc.i4.2", InlineNone, Next, Macro, Pop0, PushI;
    LdcI43 = 0x19, "ldc.i4.3", InlineNone, Next, Macro, Pop0, PushI;
    LdcI44 = 0x1A, "ldc.i4.4", InlineNone, Next, Macro, Pop0, PushI;
    LdcI45 = 0x1B, "ldc.i4.5", InlineNone, Next, Macro, Pop0, PushI;
    LdcI46 = 0x1C, "ldc.i4.6", InlineNone, Next, Macro, Pop0, PushI;
    LdcI47 = 0x1D, "ldc.i4.7", InlineNone, Next, Macro, Pop0, PushI;
    LdcI48 = 0x1E, "ldc.i4.8", InlineNone, Next, Macro, Pop0, PushI;
    LdcI4S = 0x1F, "ldc.i4.s", ShortInlineI, Next, Macro, Pop0, PushI;
    LdcI4 = 0x20, "ldc.i4", InlineI, Next, Primitive, Pop0, PushI;
    LdcI8 = 0x21, "ldc.i8", InlineI8, Next, Primitive, Pop0, PushI8;
    LdcR4 = 0x22, "ldc.r4", ShortInlineR, Next, Primitive, Pop0, PushR4;
    LdcR8 = 0x23, "ldc.r8", InlineR, Next, Primitive, Pop0, PushR8;
    Dup = 0x25, "dup", InlineNone, Next, Primitive, Pop1, Push1Push1;
    Pop = 0x26, "pop", InlineNone, Next, Primitive, Pop1, Push0;
    Jmp = 0x27, "jmp", InlineMethod, Call, Primitive, Pop0, Push0;
    Call = 0x28, "call", InlineMethod, Call, Primitive, VarPop, VarPush;
    Calli = 0x29, "calli", InlineSig, Call, Primitive, VarPop, VarPush;
    Ret = 0x2A, "ret", InlineNone, Return, Primitive, VarPop, Push0;
    BrS = 0x2B, "br.s", ShortInlineBrTarget, Branch, Macro, Pop0, Push0;
    BrfalseS = 0x2C, "brfalse.s", ShortInlineBrTarget, CondBranch, Macro, PopI, Push0;
    BrtrueS = 0x2D, "brtrue.s", ShortInlineBrTarget, CondBranch, Macro, PopI, Push0;
    BeqS = 0x2E, "beq.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgeS = 0x2F, "bge.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgtS = 0x30, "bgt.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BleS = 0x31, "ble.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BltS = 0x32, "blt.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BneUnS = 0x33, "bne.un.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgeUnS = 0x34, "bge.un.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgtUnS = 0x35, "bgt.un.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BleUnS = 0x36, "ble.un.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BltUnS = 0x37, "blt.un.s", ShortInlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Br = 0x38, "br", InlineBrTarget, Branch, Primitive, Pop0, Push0;
    Brfalse = 0x39, "brfalse", InlineBrTarget, CondBranch, Primitive, PopI, Push0;
    Brtrue = 0x3A, "brtrue", InlineBrTarget, CondBranch, Primitive, PopI, Push0;
    Beq = 0x3B, "beq", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Bge = 0x3C, "bge", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Bgt = 0x3D, "bgt", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Ble = 0x3E, "ble", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Blt = 0x3F, "blt", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BneUn = 0x40, "bne.un", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgeUn = 0x41, "bge.un", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BgtUn = 0x42, "bgt.un", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BleUn = 0x43, "ble.un", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    BltUn = 0x44, "blt.un", InlineBrTarget, CondBranch, Macro, Pop1Pop1, Push0;
    Switch = 0x45, "switch", InlineSwitch, CondBranch, Primitive, PopI, Push0;
    LdindI1 = 0x46, "ldind.i1", InlineNone, Next, Primitive, PopI, PushI;
    LdindU1 = 0x47, "ldind.u1", InlineNone, Next, Primitive, PopI, PushI;
    LdindI2 = 0x48, "ldind.i2", InlineNone, Next, Primitive, PopI, PushI;
    LdindU2 = 0x49, "ldind.u2", InlineNone, Next, Primitive, PopI, PushI;
    LdindI4 = 0x4A, "ldind.i4", InlineNone, Next, Primitive, PopI, PushI;
    LdindU4 = 0x4B, "ldind.u4", InlineNone, Next, Primitive, PopI, PushI;
    LdindI8 = 0x4C, "ldind.i8", InlineNone, Next, Primitive, PopI, PushI8;
    LdindI = 0x4D, "ldind.i", InlineNone, Next, Primitive, PopI, PushI;
    LdindR4 = 0x4E, "ldind.r4", InlineNone, Next, Primitive, PopI, PushR4;
    LdindR8 = 0x4F, "ldind.r8", InlineNone, Next, Primitive, PopI, PushR8;
    LdindRef = 0x50, "ldind.ref", InlineNone, Next, Primitive, PopI, PushRef;
    StindRef = 0x51, "stind.ref", InlineNone, Next, Primitive, PopIPopI, Push0;
    StindI1 = 0x52, "stind.i1", InlineNone, Next, Primitive, PopIPopI, Push0;
    StindI2 = 0x53, "stind.i2", InlineNone, Next, Primitive, PopIPopI, Push0;
    StindI4 = 0x54, "stind.i4", InlineNone, Next, Primitive, PopIPopI, Push0;
    StindI8 = 0x55, "stind.i8", InlineNone, Next, Primitive, PopIPopI8, Push0;
    StindR4 = 0x56, "stind.r4", InlineNone, Next, Primitive, PopIPopR4, Push0;
    StindR8 = 0x57, "stind.r8", InlineNone, Next, Primitive, PopIPopR8, Push0;
    Add = 0x58, "add", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Sub = 0x59, "sub", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Mul = 0x5A, "mul", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Div = 0x5B, "div", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    DivUn = 0x5C, "div.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Rem = 0x5D, "rem", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    RemUn = 0x5E, "rem.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    And = 0x5F, "and", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Or = 0x60, "or", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Xor = 0x61, "xor", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Shl = 0x62, "shl", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Shr = 0x63, "shr", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    ShrUn = 0x64, "shr.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Neg = 0x65, "neg", InlineNone, Next, Primitive, Pop1, Push1;
    Not = 0x66, "not", InlineNone, Next, Primitive, Pop1, Push1;
    ConvI1 = 0x67, "conv.i1", InlineNone, Next, Primitive, Pop1, PushI;
    ConvI2 = 0x68, "conv.i2", InlineNone, Next, Primitive, Pop1, PushI;
    ConvI4 = 0x69, "conv.i4", InlineNone, Next, Primitive, Pop1, PushI;
    ConvI8 = 0x6A, "conv.i8", InlineNone, Next, Primitive, Pop1, PushI8;
    ConvR4 = 0x6B, "conv.r4", InlineNone, Next, Primitive, Pop1, PushR4;
    ConvR8 = 0x6C, "conv.r8", InlineNone, Next, Primitive, Pop1, PushR8;
    ConvU4 = 0x6D, "conv.u4", InlineNone, Next, Primitive, Pop1, PushI;
    ConvU8 = 0x6E, "conv.u8", InlineNone, Next, Primitive, Pop1, PushI8;
    Callvirt = 0x6F, "callvirt", InlineMethod, Call, ObjModel, VarPop, VarPush;
    Cpobj = 0x70, "cpobj", InlineType, Next, ObjModel, PopIPopI, Push0;
    Ldobj = 0x71, "ldobj", InlineType, Next, ObjModel, PopI, Push1;
    Ldstr = 0x72, "ldstr", InlineString, Next, ObjModel, Pop0, PushRef;
    Newobj = 0x73, "newobj", InlineMethod, Call, ObjModel, VarPop, PushRef;
    Castclass = 0x74, "castclass", InlineType, Next, ObjModel, PopRef, PushRef;
    Isinst = 0x75, "isinst", InlineType, Next, ObjModel, PopRef, PushI;
    ConvRUn = 0x76, "conv.r.un", InlineNone, Next, Primitive, Pop1, PushR8;
    Unbox = 0x79, "unbox", InlineType, Next, Primitive, PopRef, PushI;
    Throw = 0x7A, "throw", InlineNone, Throw, ObjModel, PopRef, Push0;
    Ldfld = 0x7B, "ldfld", InlineField, Next, ObjModel, PopRef, Push1;
    Ldflda = 0x7C, "ldflda", InlineField, Next, ObjModel, PopRef, PushI;
    Stfld = 0x7D, "stfld", InlineField, Next, ObjModel, PopRefPop1, Push0;
    Ldsfld = 0x7E, "ldsfld", InlineField, Next, ObjModel, Pop0, Push1;
    Ldsflda = 0x7F, "ldsflda", InlineField, Next, ObjModel, Pop0, PushI;
    Stsfld = 0x80, "stsfld", InlineField, Next, ObjModel, Pop1, Push0;
    Stobj = 0x81, "stobj", InlineType, Next, Primitive, PopIPop1, Push0;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", InlineNone, Next, Primitive, Pop1, PushI8;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", InlineNone, Next, Primitive, Pop1, PushI8;
    ConvOvfIUn = 0x8A, "conv.ovf.i.un", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfUUn = 0x8B, "conv.ovf.u.un", InlineNone, Next, Primitive, Pop1, PushI;
    Box = 0x8C, "box", InlineType, Next, Primitive, Pop1, PushRef;
    Newarr = 0x8D, "newarr", InlineType, Next, ObjModel, PopI, PushRef;
    Ldlen = 0x8E, "ldlen", InlineNone, Next, ObjModel, PopRef, PushI;
    Ldelema = 0x8F, "ldelema", InlineType, Next, ObjModel, PopRefPopI, PushI;
    LdelemI1 = 0x90, "ldelem.i1", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemU1 = 0x91, "ldelem.u1", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemI2 = 0x92, "ldelem.i2", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemU2 = 0x93, "ldelem.u2", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemI4 = 0x94, "ldelem.i4", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemU4 = 0x95, "ldelem.u4", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemI8 = 0x96, "ldelem.i8", InlineNone, Next, ObjModel, PopRefPopI, PushI8;
    LdelemI = 0x97, "ldelem.i", InlineNone, Next, ObjModel, PopRefPopI, PushI;
    LdelemR4 = 0x98, "ldelem.r4", InlineNone, Next, ObjModel, PopRefPopI, PushR4;
    LdelemR8 = 0x99, "ldelem.r8", InlineNone, Next, ObjModel, PopRefPopI, PushR8;
    LdelemRef = 0x9A, "ldelem.ref", InlineNone, Next, ObjModel, PopRefPopI, PushRef;
    StelemI = 0x9B, "stelem.i", InlineNone, Next, ObjModel, PopRefPopIPopI, Push0;
    StelemI1 = 0x9C, "stelem.i1", InlineNone, Next, ObjModel, PopRefPopIPopI, Push0;
    StelemI2 = 0x9D, "stelem.i2", InlineNone, Next, ObjModel, PopRefPopIPopI, Push0;
    StelemI4 = 0x9E, "stelem.i4", InlineNone, Next, ObjModel, PopRefPopIPopI, Push0;
    StelemI8 = 0x9F, "stelem.i8", InlineNone, Next, ObjModel, PopRefPopIPopI8, Push0;
    StelemR4 = 0xA0, "stelem.r4", InlineNone, Next, ObjModel, PopRefPopIPopR4, Push0;
    StelemR8 = 0xA1, "stelem.r8", InlineNone, Next, ObjModel, PopRefPopIPopR8, Push0;
    StelemRef = 0xA2, "stelem.ref", InlineNone, Next, ObjModel, PopRefPopIPopRef, Push0;
    Ldelem = 0xA3, "ldelem", InlineType, Next, ObjModel, PopRefPopI, Push1;
    Stelem = 0xA4, "stelem", InlineType, Next, ObjModel, PopRefPopIPop1, Push0;
    UnboxAny = 0xA5, "unbox.any", InlineType, Next, ObjModel, PopRef, Push1;
    ConvOvfI1 = 0xB3, "conv.ovf.i1", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU1 = 0xB4, "conv.ovf.u1", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI2 = 0xB5, "conv.ovf.i2", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU2 = 0xB6, "conv.ovf.u2", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI4 = 0xB7, "conv.ovf.i4", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU4 = 0xB8, "conv.ovf.u4", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI8 = 0xB9, "conv.ovf.i8", InlineNone, Next, Primitive, Pop1, PushI8;
    ConvOvfU8 = 0xBA, "conv.ovf.u8", InlineNone, Next, Primitive, Pop1, PushI8;
    Refanyval = 0xC2, "refanyval", InlineType, Next, Primitive, Pop1, PushI;
    Ckfinite = 0xC3, "ckfinite", InlineNone, Next, Primitive, Pop1, PushR8;
    Mkrefany = 0xC6, "mkrefany", InlineType, Next, Primitive, PopI, Push1;
    Ldtoken = 0xD0, "ldtoken", InlineTok, Next, Primitive, Pop0, PushI;
    ConvU2 = 0xD1, "conv.u2", InlineNone, Next, Primitive, Pop1, PushI;
    ConvU1 = 0xD2, "conv.u1", InlineNone, Next, Primitive, Pop1, PushI;
    ConvI = 0xD3, "conv.i", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfI = 0xD4, "conv.ovf.i", InlineNone, Next, Primitive, Pop1, PushI;
    ConvOvfU = 0xD5, "conv.ovf.u", InlineNone, Next, Primitive, Pop1, PushI;
    AddOvf = 0xD6, "add.ovf", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    AddOvfUn = 0xD7, "add.ovf.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    MulOvf = 0xD8, "mul.ovf", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    MulOvfUn = 0xD9, "mul.ovf.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    SubOvf = 0xDA, "sub.ovf", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    SubOvfUn = 0xDB, "sub.ovf.un", InlineNone, Next, Primitive, Pop1Pop1, Push1;
    Endfinally = 0xDC, "endfinally", InlineNone, Return, Primitive, PopAll, Push0;
    Leave = 0xDD, "leave", InlineBrTarget, Branch, Primitive, PopAll, Push0;
    LeaveS = 0xDE, "leave.s", ShortInlineBrTarget, Branch, Macro, PopAll, Push0;
    StindI = 0xDF, "stind.i", InlineNone, Next, Primitive, PopIPopI, Push0;
    ConvU = 0xE0, "conv.u", InlineNone, Next, Primitive, Pop1, PushI;
    Arglist = 0xFE00, "arglist", InlineNone, Next, Primitive, Pop0, PushI;
    Ceq = 0xFE01, "ceq", InlineNone, Next, Primitive, Pop1Pop1, PushI;
    Cgt = 0xFE02, "cgt", InlineNone, Next, Primitive, Pop1Pop1, PushI;
    CgtUn = 0xFE03, "cgt.un", InlineNone, Next, Primitive, Pop1Pop1, PushI;
    Clt = 0xFE04, "clt", InlineNone, Next, Primitive, Pop1Pop1, PushI;
    CltUn = 0xFE05, "clt.un", InlineNone, Next, Primitive, Pop1Pop1, PushI;
    Ldftn = 0xFE06, "ldftn", InlineMethod, Next, Primitive, Pop0, PushI;
    Ldvirtftn = 0xFE07, "ldvirtftn", InlineMethod, Next, Primitive, PopRef, PushI;
    Ldarg = 0xFE09, "ldarg", InlineArgument, Next, Primitive, Pop0, Push1;
    Ldarga = 0xFE0A, "ldarga", InlineArgument, Next, Primitive, Pop0, PushI;
    Starg = 0xFE0B, "starg", InlineArgument, Next, Primitive, Pop1, Push0;
    Ldloc = 0xFE0C, "ldloc", InlineVar, Next, Primitive, Pop0, Push1;
    Ldloca = 0xFE0D, "ldloca", InlineVar, Next, Primitive, Pop0, PushI;
    Stloc = 0xFE0E, "stloc", InlineVar, Next, Primitive, Pop1, Push0;
    Localloc = 0xFE0F, "localloc", InlineNone, Next, Primitive, PopI, PushI;
    Endfilter = 0xFE11, "endfilter", InlineNone, Return, Primitive, PopI, Push0;
    Unaligned = 0xFE12, "unaligned.", ShortInlineI, Meta, Prefix, Pop0, Push0;
    Volatile = 0xFE13, "volatile.", InlineNone, Meta, Prefix, Pop0, Push0;
    Tailcall = 0xFE14, "tail.", InlineNone, Meta, Prefix, Pop0, Push0;
    Initobj = 0xFE15, "initobj", InlineType, Next, ObjModel, PopI, Push0;
    Constrained = 0xFE16, "constrained.", InlineType, Meta, Prefix, Pop0, Push0;
    Cpblk = 0xFE17, "cpblk", InlineNone, Next, Primitive, PopIPopIPopI, Push0;
    Initblk = 0xFE18, "initblk", InlineNone, Next, Primitive, PopIPopIPopI, Push0;
    Rethrow = 0xFE1A, "rethrow", InlineNone, Throw, ObjModel, Pop0, Push0;
    Sizeof = 0xFE1C, "sizeof", InlineType, Next, Primitive, Pop0, PushI;
    Refanytype = 0xFE1D, "refanytype", InlineNone, Next, Primitive, Pop1, PushI;
    Readonly = 0xFE1E, "readonly.", InlineNone, Meta, Prefix, Pop0, Push0;
}

impl CilCode {
    /// Looks up an opcode from its encoded bytes. `second` is only consulted when `first` is
    /// the `0xFE` escape byte.
    #[must_use]
    pub fn from_bytes(first: u8, second: Option<u8>) -> Option<CilCode> {
        if first == 0xFE {
            second.and_then(|second| CilCode::from_repr(0xFE00 | u16::from(second)))
        } else {
            CilCode::from_repr(u16::from(first))
        }
    }

    /// Mnemonic of this opcode.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.op_code().mnemonic
    }

    /// Operand encoding of this opcode.
    #[must_use]
    pub fn operand_type(self) -> CilOperandType {
        self.op_code().operand_type
    }

    /// Flow control class of this opcode.
    #[must_use]
    pub fn flow_control(self) -> CilFlowControl {
        self.op_code().flow_control
    }
}

impl fmt::Display for CilCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn table_is_consistent() {
        for code in CilCode::iter() {
            let opcode = code.op_code();
            assert_eq!(opcode.code, code);
            assert!(!opcode.mnemonic.is_empty());

            let encoded = match opcode.byte2() {
                Some(second) => CilCode::from_bytes(opcode.byte1(), Some(second)),
                None => CilCode::from_bytes(opcode.byte1(), None),
            };
            assert_eq!(encoded, Some(code), "{}", opcode.mnemonic);
        }
    }

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in CilCode::iter() {
            assert!(seen.insert(code.mnemonic()), "{}", code.mnemonic());
        }
        assert_eq!(seen.len(), CilCode::COUNT);
    }

    #[test]
    fn two_byte_opcodes() {
        let ldloc = CilCode::Ldloc.op_code();
        assert!(ldloc.is_large());
        assert_eq!(ldloc.size(), 2);
        assert_eq!(ldloc.byte1(), 0xFE);
        assert_eq!(ldloc.byte2(), Some(0x0C));
        assert_eq!(ldloc.operand_type, CilOperandType::InlineVar);

        assert_eq!(CilCode::from_bytes(0xFE, Some(0x08)), None);
        assert_eq!(CilCode::from_bytes(0xFE, None), None);
        assert_eq!(CilCode::from_bytes(0x24, None), None);
    }

    #[test]
    fn stack_behaviour() {
        let stelem = CilCode::StelemRef.op_code();
        assert_eq!(stelem.stack_pop.slots(), Some(3));
        assert_eq!(stelem.stack_push.slots(), Some(0));
        assert_eq!(CilCode::Call.op_code().stack_pop.slots(), None);
        assert_eq!(CilCode::Dup.op_code().stack_push.slots(), Some(2));
    }
}
