//! Arena-backed instruction list.
//!
//! Instructions live in an append-only arena and the list order is kept separately, so an
//! [`InstructionId`] stays valid for the lifetime of the collection. Labels and exception
//! handler bounds hold ids, which keeps them attached to the same instruction across
//! insertions, removals and macro rewrites. Offsets are only refreshed by
//! [`CilInstructionCollection::calculate_offsets`].

use std::fmt::Write as _;

use super::{
    instruction::ldc_i4_encoding, ArgumentRef, CilCode, CilInstruction, CilLabel, CilOperand,
    CilOperandType, InstructionId, LocalRef,
};
use crate::{Error, Result};

/// Ordered, editable list of instructions of one method body.
#[derive(Debug, Clone, Default)]
pub struct CilInstructionCollection {
    arena: Vec<CilInstruction>,
    order: Vec<InstructionId>,
    /// Whether the owning method has an implicit `this` argument. Needed to encode declared
    /// parameters.
    pub has_this: bool,
}

impl CilInstructionCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new(has_this: bool) -> Self {
        CilInstructionCollection {
            arena: Vec::new(),
            order: Vec::new(),
            has_this,
        }
    }

    /// Number of instructions in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total encoded size of the instructions.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.iter().map(CilInstruction::size).sum()
    }

    /// Appends an instruction.
    pub fn push(&mut self, instruction: CilInstruction) -> InstructionId {
        let id = InstructionId(self.arena.len());
        self.arena.push(instruction);
        self.order.push(id);
        id
    }

    /// Inserts an instruction at `position` in the list.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `position` is past the end of the list.
    pub fn insert(&mut self, position: usize, instruction: CilInstruction) -> Result<InstructionId> {
        if position > self.order.len() {
            return Err(Error::IndexOutOfRange {
                index: position,
                count: self.order.len(),
            });
        }

        let id = InstructionId(self.arena.len());
        self.arena.push(instruction);
        self.order.insert(position, id);
        Ok(id)
    }

    /// Removes the instruction at `position` from the list and returns its id. The instruction
    /// stays reachable through [`Self::get`], so dangling labels can still be reported.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `position` is past the end of the list.
    pub fn remove_at(&mut self, position: usize) -> Result<InstructionId> {
        if position >= self.order.len() {
            return Err(Error::IndexOutOfRange {
                index: position,
                count: self.order.len(),
            });
        }
        Ok(self.order.remove(position))
    }

    /// Removes an instruction from the list. Returns `false` if it was not part of it.
    pub fn remove(&mut self, id: InstructionId) -> bool {
        match self.position_of(id) {
            Some(position) => {
                self.order.remove(position);
                true
            }
            None => false,
        }
    }

    /// Removes all instructions.
    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// The instruction with the given id.
    #[must_use]
    pub fn get(&self, id: InstructionId) -> Option<&CilInstruction> {
        self.arena.get(id.0)
    }

    /// Mutable access to the instruction with the given id.
    pub fn get_mut(&mut self, id: InstructionId) -> Option<&mut CilInstruction> {
        self.arena.get_mut(id.0)
    }

    /// The id of the instruction at `position` in the list.
    #[must_use]
    pub fn id_at(&self, position: usize) -> Option<InstructionId> {
        self.order.get(position).copied()
    }

    /// The instruction at `position` in the list.
    #[must_use]
    pub fn at(&self, position: usize) -> Option<&CilInstruction> {
        self.id_at(position).and_then(|id| self.get(id))
    }

    /// Position of an instruction in the list.
    #[must_use]
    pub fn position_of(&self, id: InstructionId) -> Option<usize> {
        self.order.iter().position(|&candidate| candidate == id)
    }

    /// Returns `true` if the instruction is part of the list.
    #[must_use]
    pub fn contains(&self, id: InstructionId) -> bool {
        self.position_of(id).is_some()
    }

    /// Ids in list order.
    pub fn ids(&self) -> impl Iterator<Item = InstructionId> + '_ {
        self.order.iter().copied()
    }

    /// Instructions in list order.
    pub fn iter(&self) -> impl Iterator<Item = &CilInstruction> + '_ {
        self.order.iter().map(|id| &self.arena[id.0])
    }

    /// Ids and instructions in list order.
    pub fn iter_with_ids(&self) -> impl Iterator<Item = (InstructionId, &CilInstruction)> + '_ {
        self.order.iter().map(|&id| (id, &self.arena[id.0]))
    }

    /// Assigns every instruction its offset, starting at 0.
    pub fn calculate_offsets(&mut self) {
        let mut offset = 0u32;
        for id in &self.order {
            let instruction = &mut self.arena[id.0];
            instruction.offset = offset;
            offset += instruction.size();
        }
    }

    /// Position of the instruction starting at `offset`, using a binary search over the
    /// current offsets.
    #[must_use]
    pub fn index_by_offset(&self, offset: u32) -> Option<usize> {
        self.order
            .binary_search_by_key(&offset, |id| self.arena[id.0].offset)
            .ok()
    }

    /// Id of the instruction starting at `offset`.
    #[must_use]
    pub fn get_by_offset(&self, offset: u32) -> Option<InstructionId> {
        self.index_by_offset(offset).map(|position| self.order[position])
    }

    /// Offset one past the last instruction, based on the current offsets.
    #[must_use]
    pub fn end_offset(&self) -> u32 {
        self.order
            .last()
            .map_or(0, |id| self.arena[id.0].offset + self.arena[id.0].size())
    }

    /// A label for `offset`: the instruction starting there, the end of the code, or a raw
    /// offset if neither matches.
    #[must_use]
    pub fn label_at(&self, offset: u32) -> CilLabel {
        match self.get_by_offset(offset) {
            Some(id) => CilLabel::Instruction(id),
            None if offset == self.end_offset() => CilLabel::End,
            None => CilLabel::Offset(offset),
        }
    }

    /// Current offset of a label.
    #[must_use]
    pub fn label_offset(&self, label: &CilLabel) -> Option<u32> {
        match label {
            CilLabel::Instruction(id) => self.get(*id).map(|instruction| instruction.offset),
            CilLabel::Offset(offset) => Some(*offset),
            CilLabel::End => Some(self.end_offset()),
        }
    }

    /// Returns `true` if `label` points at an instruction in the list or at the end of the code.
    #[must_use]
    pub fn is_label_present(&self, label: &CilLabel) -> bool {
        match label {
            CilLabel::Instruction(id) => self
                .get(*id)
                .and_then(|instruction| self.get_by_offset(instruction.offset))
                == Some(*id),
            CilLabel::Offset(offset) => {
                self.index_by_offset(*offset).is_some() || *offset == self.end_offset()
            }
            CilLabel::End => true,
        }
    }

    /// Checks that every branch and switch target refers to an instruction of the list or to
    /// the end of the code. Offsets must be current.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] naming the first instruction with a missing target.
    pub fn verify_labels(&self) -> Result<()> {
        for instruction in self.iter() {
            let missing = match instruction.operand() {
                CilOperand::Label(label) => (!self.is_label_present(label)).then_some(*label),
                CilOperand::Switch(labels) => labels
                    .iter()
                    .find(|label| !self.is_label_present(label))
                    .copied(),
                _ => None,
            };

            if let Some(label) = missing {
                return Err(Error::InvalidArgument(format!(
                    "Instruction IL_{:04X} ({}) targets {}, which is not part of the method body",
                    instruction.offset,
                    instruction.opcode().mnemonic,
                    label
                )));
            }
        }
        Ok(())
    }

    /// Rewrites every macro instruction into its general form with an explicit operand.
    ///
    /// Instruction sizes change, so offsets must be recalculated before they are used again.
    pub fn expand_macros(&mut self) {
        for id in &self.order {
            expand_macro(&mut self.arena[id.0]);
        }
    }

    /// Picks the smallest encoding for every branch, `ldc.i4`, local and argument instruction.
    ///
    /// Offsets are calculated before the pass and after it. The pass runs once: a branch whose
    /// displacement only fits a short encoding after other instructions shrank keeps its long
    /// encoding until the next call.
    pub fn optimize_macros(&mut self) {
        self.calculate_offsets();

        let updates: Vec<(InstructionId, CilCode, Option<CilOperand>)> = self
            .iter_with_ids()
            .filter_map(|(id, instruction)| {
                self.optimized(instruction)
                    .map(|(code, operand)| (id, code, operand))
            })
            .collect();

        for (id, code, operand) in updates {
            let instruction = &mut self.arena[id.0];
            match operand {
                Some(operand) => {
                    // Only encodings produced by `optimized` reach this point.
                    if instruction.set(code, operand).is_err() {
                        continue;
                    }
                }
                None => instruction.set_code_unchecked(code),
            }
        }

        self.calculate_offsets();
    }

    fn optimized(&self, instruction: &CilInstruction) -> Option<(CilCode, Option<CilOperand>)> {
        let code = instruction.code();
        match instruction.opcode().operand_type {
            CilOperandType::InlineBrTarget | CilOperandType::ShortInlineBrTarget => {
                let CilOperand::Label(label) = instruction.operand() else {
                    return None;
                };
                let target = i64::from(self.label_offset(label)?);
                let next = i64::from(instruction.offset) + i64::from(instruction.size());
                let delta = target - next;
                let short = (-128..=127).contains(&delta);

                let optimized = if short {
                    short_branch(code)
                } else {
                    long_branch(code)
                };
                (optimized != code).then_some((optimized, None))
            }
            CilOperandType::InlineI | CilOperandType::ShortInlineI if instruction.is_ldc_i4() => {
                let value = instruction.ldc_i4_constant()?;
                let (optimized, operand) = ldc_i4_encoding(value);
                (optimized != code).then_some((optimized, Some(operand)))
            }
            CilOperandType::InlineVar | CilOperandType::ShortInlineVar => {
                let CilOperand::Local(local) = instruction.operand() else {
                    return None;
                };
                let (optimized, operand) = optimize_local(code, *local);
                (optimized != code).then_some((optimized, Some(operand)))
            }
            CilOperandType::InlineArgument | CilOperandType::ShortInlineArgument => {
                let CilOperand::Argument(argument) = instruction.operand() else {
                    return None;
                };
                let (optimized, operand) = optimize_argument(code, *argument, self.has_this);
                (optimized != code).then_some((optimized, Some(operand)))
            }
            _ => None,
        }
    }

    /// Renders the instructions one per line, with labels resolved to offsets.
    #[must_use]
    pub fn format(&self) -> String {
        let mut output = String::new();
        for instruction in self.iter() {
            let _ = write!(
                output,
                "IL_{:04X}: {}",
                instruction.offset,
                instruction.opcode().mnemonic
            );
            match instruction.operand() {
                CilOperand::None => {}
                CilOperand::Label(label) => {
                    let _ = write!(output, " {}", self.format_label(label));
                }
                CilOperand::Switch(labels) => {
                    let labels: Vec<String> =
                        labels.iter().map(|label| self.format_label(label)).collect();
                    let _ = write!(output, " ({})", labels.join(", "));
                }
                operand => {
                    let _ = write!(output, " {operand}");
                }
            }
            output.push('\n');
        }
        output
    }

    fn format_label(&self, label: &CilLabel) -> String {
        match self.label_offset(label) {
            Some(offset) => format!("IL_{offset:04X}"),
            None => label.to_string(),
        }
    }
}

fn expand_macro(instruction: &mut CilInstruction) {
    let code = instruction.code();
    let expanded = match code {
        CilCode::LdcI4M1
        | CilCode::LdcI40
        | CilCode::LdcI41
        | CilCode::LdcI42
        | CilCode::LdcI43
        | CilCode::LdcI44
        | CilCode::LdcI45
        | CilCode::LdcI46
        | CilCode::LdcI47
        | CilCode::LdcI48
        | CilCode::LdcI4S => instruction
            .ldc_i4_constant()
            .map(|value| (CilCode::LdcI4, Some(CilOperand::I32(value)))),
        CilCode::Ldarg0 | CilCode::Ldarg1 | CilCode::Ldarg2 | CilCode::Ldarg3 => instruction
            .argument_index(false)
            .map(|index| (CilCode::Ldarg, Some(CilOperand::Argument(ArgumentRef::Index(index))))),
        CilCode::Ldloc0 | CilCode::Ldloc1 | CilCode::Ldloc2 | CilCode::Ldloc3 => instruction
            .local_index()
            .map(|index| (CilCode::Ldloc, Some(CilOperand::Local(LocalRef::Index(index))))),
        CilCode::Stloc0 | CilCode::Stloc1 | CilCode::Stloc2 | CilCode::Stloc3 => instruction
            .local_index()
            .map(|index| (CilCode::Stloc, Some(CilOperand::Local(LocalRef::Index(index))))),
        CilCode::LdargS => Some((CilCode::Ldarg, None)),
        CilCode::LdargaS => Some((CilCode::Ldarga, None)),
        CilCode::StargS => Some((CilCode::Starg, None)),
        CilCode::LdlocS => Some((CilCode::Ldloc, None)),
        CilCode::LdlocaS => Some((CilCode::Ldloca, None)),
        CilCode::StlocS => Some((CilCode::Stloc, None)),
        _ if instruction.is_branch() => {
            let long = long_branch(code);
            (long != code).then_some((long, None))
        }
        _ => None,
    };

    match expanded {
        Some((code, Some(operand))) => {
            let _ = instruction.set(code, operand);
        }
        Some((code, None)) => instruction.set_code_unchecked(code),
        None => {}
    }
}

fn short_branch(code: CilCode) -> CilCode {
    match code {
        CilCode::Br => CilCode::BrS,
        CilCode::Brfalse => CilCode::BrfalseS,
        CilCode::Brtrue => CilCode::BrtrueS,
        CilCode::Beq => CilCode::BeqS,
        CilCode::Bge => CilCode::BgeS,
        CilCode::Bgt => CilCode::BgtS,
        CilCode::Ble => CilCode::BleS,
        CilCode::Blt => CilCode::BltS,
        CilCode::BneUn => CilCode::BneUnS,
        CilCode::BgeUn => CilCode::BgeUnS,
        CilCode::BgtUn => CilCode::BgtUnS,
        CilCode::BleUn => CilCode::BleUnS,
        CilCode::BltUn => CilCode::BltUnS,
        CilCode::Leave => CilCode::LeaveS,
        other => other,
    }
}

fn long_branch(code: CilCode) -> CilCode {
    match code {
        CilCode::BrS => CilCode::Br,
        CilCode::BrfalseS => CilCode::Brfalse,
        CilCode::BrtrueS => CilCode::Brtrue,
        CilCode::BeqS => CilCode::Beq,
        CilCode::BgeS => CilCode::Bge,
        CilCode::BgtS => CilCode::Bgt,
        CilCode::BleS => CilCode::Ble,
        CilCode::BltS => CilCode::Blt,
        CilCode::BneUnS => CilCode::BneUn,
        CilCode::BgeUnS => CilCode::BgeUn,
        CilCode::BgtUnS => CilCode::BgtUn,
        CilCode::BleUnS => CilCode::BleUn,
        CilCode::BltUnS => CilCode::BltUn,
        CilCode::LeaveS => CilCode::Leave,
        other => other,
    }
}

fn optimize_local(code: CilCode, local: LocalRef) -> (CilCode, CilOperand) {
    let index = local.index();
    let operand = CilOperand::Local(local);
    let short = index <= u16::from(u8::MAX);

    match code {
        CilCode::Ldloc | CilCode::LdlocS => match index {
            0 => (CilCode::Ldloc0, CilOperand::None),
            1 => (CilCode::Ldloc1, CilOperand::None),
            2 => (CilCode::Ldloc2, CilOperand::None),
            3 => (CilCode::Ldloc3, CilOperand::None),
            _ if short => (CilCode::LdlocS, operand),
            _ => (CilCode::Ldloc, operand),
        },
        CilCode::Stloc | CilCode::StlocS => match index {
            0 => (CilCode::Stloc0, CilOperand::None),
            1 => (CilCode::Stloc1, CilOperand::None),
            2 => (CilCode::Stloc2, CilOperand::None),
            3 => (CilCode::Stloc3, CilOperand::None),
            _ if short => (CilCode::StlocS, operand),
            _ => (CilCode::Stloc, operand),
        },
        CilCode::Ldloca | CilCode::LdlocaS if short => (CilCode::LdlocaS, operand),
        CilCode::Ldloca | CilCode::LdlocaS => (CilCode::Ldloca, operand),
        other => (other, operand),
    }
}

fn optimize_argument(code: CilCode, argument: ArgumentRef, has_this: bool) -> (CilCode, CilOperand) {
    let index = argument.index(has_this);
    let operand = CilOperand::Argument(argument);
    let short = index <= u16::from(u8::MAX);

    match code {
        CilCode::Ldarg | CilCode::LdargS => match index {
            0 => (CilCode::Ldarg0, CilOperand::None),
            1 => (CilCode::Ldarg1, CilOperand::None),
            2 => (CilCode::Ldarg2, CilOperand::None),
            3 => (CilCode::Ldarg3, CilOperand::None),
            _ if short => (CilCode::LdargS, operand),
            _ => (CilCode::Ldarg, operand),
        },
        CilCode::Starg | CilCode::StargS if short => (CilCode::StargS, operand),
        CilCode::Starg | CilCode::StargS => (CilCode::Starg, operand),
        CilCode::Ldarga | CilCode::LdargaS if short => (CilCode::LdargaS, operand),
        CilCode::Ldarga | CilCode::LdargaS => (CilCode::Ldarga, operand),
        other => (other, operand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(code: CilCode) -> CilInstruction {
        CilInstruction::simple(code).unwrap()
    }

    fn branch(code: CilCode, target: InstructionId) -> CilInstruction {
        CilInstruction::new(code, CilOperand::Label(CilLabel::Instruction(target))).unwrap()
    }

    #[test]
    fn ids_survive_edits() {
        let mut instructions = CilInstructionCollection::new(false);
        let first = instructions.push(simple(CilCode::Nop));
        let ret = instructions.push(simple(CilCode::Ret));
        let inserted = instructions.insert(1, simple(CilCode::Dup)).unwrap();

        assert_eq!(instructions.position_of(ret), Some(2));
        assert_eq!(instructions.id_at(1), Some(inserted));

        assert!(instructions.remove(first));
        assert!(!instructions.contains(first));
        assert!(instructions.get(first).is_some());
        assert_eq!(instructions.position_of(ret), Some(1));
        assert!(instructions.insert(5, simple(CilCode::Nop)).is_err());
    }

    #[test]
    fn offsets_and_lookup() {
        let mut instructions = CilInstructionCollection::new(false);
        instructions.push(CilInstruction::ldc_i4(1000));
        let add = instructions.push(simple(CilCode::Add));
        instructions.push(simple(CilCode::Ret));
        instructions.calculate_offsets();

        assert_eq!(instructions.get(add).unwrap().offset, 5);
        assert_eq!(instructions.get_by_offset(5), Some(add));
        assert_eq!(instructions.get_by_offset(3), None);
        assert_eq!(instructions.end_offset(), 7);
        assert_eq!(instructions.label_at(7), CilLabel::End);
        assert_eq!(instructions.label_at(2), CilLabel::Offset(2));
    }

    #[test]
    fn expand_then_optimize_keeps_semantics() {
        let mut instructions = CilInstructionCollection::new(true);
        instructions.push(simple(CilCode::Ldarg0));
        instructions.push(simple(CilCode::Ldloc1));
        instructions.push(CilInstruction::ldc_i4(5));
        instructions.push(CilInstruction::ldc_i4(100));
        instructions.push(
            CilInstruction::new(CilCode::StlocS, CilOperand::Local(LocalRef::Variable(4)))
                .unwrap(),
        );
        instructions.push(simple(CilCode::Ret));
        let ret = instructions.id_at(5).unwrap();
        instructions.insert(0, branch(CilCode::BrS, ret)).unwrap();

        let before: Vec<CilCode> = instructions.iter().map(CilInstruction::code).collect();

        instructions.expand_macros();
        instructions.calculate_offsets();
        let expanded: Vec<CilCode> = instructions.iter().map(CilInstruction::code).collect();
        assert_eq!(
            expanded,
            vec![
                CilCode::Br,
                CilCode::Ldarg,
                CilCode::Ldloc,
                CilCode::LdcI4,
                CilCode::LdcI4,
                CilCode::Stloc,
                CilCode::Ret
            ]
        );
        assert_eq!(instructions.at(1).unwrap().argument_index(true), Some(0));
        assert_eq!(instructions.at(2).unwrap().local_index(), Some(1));

        instructions.optimize_macros();
        let optimized: Vec<CilCode> = instructions.iter().map(CilInstruction::code).collect();
        assert_eq!(optimized, before);
        assert_eq!(instructions.at(4).unwrap().ldc_i4_constant(), Some(100));
        assert_eq!(instructions.at(5).unwrap().local_index(), Some(4));
    }

    fn branch_over(padding: usize) -> CilInstructionCollection {
        let mut instructions = CilInstructionCollection::new(false);
        for _ in 0..padding {
            instructions.push(simple(CilCode::Nop));
        }
        let ret = instructions.push(simple(CilCode::Ret));
        instructions.insert(0, branch(CilCode::Br, ret)).unwrap();
        instructions
    }

    #[test]
    fn branch_displacement_boundary() {
        // Measured from the end of the long form, the displacement equals the padding size.
        let mut fits = branch_over(127);
        fits.optimize_macros();
        assert_eq!(fits.at(0).unwrap().code(), CilCode::BrS);

        let mut too_far = branch_over(128);
        too_far.optimize_macros();
        assert_eq!(too_far.at(0).unwrap().code(), CilCode::Br);
    }

    #[test]
    fn backward_branch_boundary() {
        let mut instructions = CilInstructionCollection::new(false);
        let target = instructions.push(simple(CilCode::Nop));
        for _ in 0..125 {
            instructions.push(simple(CilCode::Nop));
        }
        instructions.push(branch(CilCode::BrS, target));
        instructions.optimize_macros();
        // 0 - (126 + 2) = -128
        assert_eq!(instructions.at(126).unwrap().code(), CilCode::BrS);

        instructions.insert(1, simple(CilCode::Nop)).unwrap();
        instructions.optimize_macros();
        assert_eq!(instructions.at(127).unwrap().code(), CilCode::Br);
    }

    #[test]
    fn branch_fifty_bytes_ahead() {
        let mut instructions = branch_over(50);
        instructions.optimize_macros();
        let branch = instructions.at(0).unwrap();
        assert_eq!(branch.code(), CilCode::BrS);
        assert_eq!(branch.size(), 2);
    }

    #[test]
    fn optimization_is_single_pass() {
        // The outer branch only fits a short encoding once the inner one has shrunk.
        let mut instructions = CilInstructionCollection::new(false);
        let next = instructions.push(simple(CilCode::Nop));
        for _ in 0..123 {
            instructions.push(simple(CilCode::Nop));
        }
        let ret = instructions.push(simple(CilCode::Ret));
        instructions.insert(0, branch(CilCode::Br, next)).unwrap();
        instructions.insert(0, branch(CilCode::Br, ret)).unwrap();

        instructions.optimize_macros();
        assert_eq!(instructions.at(0).unwrap().code(), CilCode::Br);
        assert_eq!(instructions.at(1).unwrap().code(), CilCode::BrS);

        instructions.optimize_macros();
        assert_eq!(instructions.at(0).unwrap().code(), CilCode::BrS);
    }

    #[test]
    fn labels_follow_instructions() {
        let mut instructions = branch_over(2);
        let ret = instructions.id_at(3).unwrap();
        instructions.calculate_offsets();
        assert!(instructions.is_label_present(&CilLabel::Instruction(ret)));
        instructions.verify_labels().unwrap();

        instructions.remove(ret);
        instructions.calculate_offsets();
        assert!(!instructions.is_label_present(&CilLabel::Instruction(ret)));
        assert!(instructions.is_label_present(&CilLabel::End));
        assert!(!instructions.is_label_present(&CilLabel::Offset(3)));
        assert!(instructions.verify_labels().is_err());
    }

    #[test]
    fn format_resolves_labels() {
        let mut instructions = branch_over(1);
        instructions.calculate_offsets();
        assert_eq!(instructions.format(), "IL_0000: br IL_0006\nIL_0005: nop\nIL_0006: ret\n");
    }
}
