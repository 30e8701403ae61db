//! ARMv8 (AArch64) lifting rules.

use super::arm::{condition_opcode, leading_registers, lsl_suffix, register_size, stack_adjust, three_operand, transfer};
use super::{immediate, no_rule, operand, IsilBuilder, IsilOperand, Lifter, LiftError, OpCode, TEMP};
use crate::decoder::{Instruction, Operand};

pub(super) struct Arm64Lifter;

impl Arm64Lifter {
    pub(super) fn new() -> Self {
        Self
    }

    fn call_target(&self, insn: &Instruction) -> Result<IsilOperand, LiftError> {
        match insn.operand(0) {
            Some(Operand::Immediate(imm)) => imm
                .as_i64()
                .map(|t| IsilOperand::address(t as u64))
                .ok_or_else(|| no_rule(insn, "non-integer branch target")),
            _ => operand(insn, 0),
        }
    }

    /// `CBZ`/`CBNZ`/`TBZ`/`TBNZ`: compare a register and branch.
    fn compare_and_branch(&self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        let mnemonic = insn.mnemonic.as_str();
        let opcode = if mnemonic.ends_with("NZ") {
            OpCode::JumpIfNotEqual
        } else {
            OpCode::JumpIfEqual
        };
        let tested = operand(insn, 0)?;

        if mnemonic.starts_with('T') {
            let bit = immediate(insn, 1)?;
            let target = immediate(insn, 2)? as u64;
            let mask = 1i64.checked_shl(bit as u32).unwrap_or(0);
            builder.emit(OpCode::And, vec![IsilOperand::reg(TEMP), tested, IsilOperand::int(mask)]);
            builder.emit(OpCode::Compare, vec![IsilOperand::reg(TEMP), IsilOperand::int(0)]);
            builder.conditional(opcode, target)
        } else {
            let target = immediate(insn, 1)? as u64;
            builder.emit(OpCode::Compare, vec![tested, IsilOperand::int(0)]);
            builder.conditional(opcode, target)
        }
    }
}

impl Lifter for Arm64Lifter {
    fn lift(&mut self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        let mnemonic = insn.mnemonic.as_str();

        match mnemonic {
            "MOV" | "MOVZ" | "MOVN" | "FMOV" | "SXTW" | "SXTH" | "SXTB" | "UXTW" | "UXTH" | "UXTB" => {
                builder.emit(OpCode::Move, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "MOVK" => {
                let dst = operand(insn, 0)?;
                let value = immediate(insn, 1)? << lsl_suffix(&insn.text);
                builder.emit(OpCode::Or, vec![dst.clone(), dst, IsilOperand::int(value)]);
            }
            "ADD" | "SUB" if stack_adjust(insn).is_some() => {
                let amount = stack_adjust(insn).unwrap_or(0);
                let shift = if mnemonic == "SUB" { -amount } else { amount };
                builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(shift)]);
            }
            "ADD" | "ADDS" => three_operand(insn, builder, OpCode::Add)?,
            "SUB" | "SUBS" => three_operand(insn, builder, OpCode::Subtract)?,
            "MUL" => three_operand(insn, builder, OpCode::Multiply)?,
            "SDIV" | "UDIV" => three_operand(insn, builder, OpCode::Divide)?,
            "AND" | "ANDS" => three_operand(insn, builder, OpCode::And)?,
            "ORR" => three_operand(insn, builder, OpCode::Or)?,
            "EOR" => three_operand(insn, builder, OpCode::Xor)?,
            "LSL" => three_operand(insn, builder, OpCode::ShiftLeft)?,
            "LSR" | "ASR" => three_operand(insn, builder, OpCode::ShiftRight)?,
            "MVN" => {
                builder.emit(OpCode::Not, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "NEG" | "NEGS" => {
                builder.emit(OpCode::Negate, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "CMP" | "CMN" | "TST" => {
                builder.emit(OpCode::Compare, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "ADR" | "ADRP" => {
                let target = immediate(insn, 1)? as u64;
                builder.emit(OpCode::LoadAddress, vec![operand(insn, 0)?, IsilOperand::address(target)]);
            }
            "LDP" | "LDPSW" | "LDNP" => {
                let registers = leading_registers(insn, 2)?;
                transfer(insn, builder, &registers, true, register_size)?;
            }
            "STP" | "STNP" => {
                let registers = leading_registers(insn, 2)?;
                transfer(insn, builder, &registers, false, register_size)?;
            }
            m if m.starts_with("LDR") || m.starts_with("LDUR") => {
                let registers = leading_registers(insn, 1)?;
                transfer(insn, builder, &registers, true, register_size)?;
            }
            m if m.starts_with("STR") || m.starts_with("STUR") => {
                let registers = leading_registers(insn, 1)?;
                transfer(insn, builder, &registers, false, register_size)?;
            }
            "B" => {
                let target = immediate(insn, 0)? as u64;
                builder.branch(target);
            }
            m if m.starts_with("B.") => {
                let opcode = condition_opcode(&m[2..]).ok_or_else(|| no_rule(insn, "overflow condition"))?;
                let target = immediate(insn, 0)? as u64;
                if opcode == OpCode::Jump {
                    builder.branch(target);
                } else {
                    builder.conditional(opcode, target)?;
                }
            }
            "CBZ" | "CBNZ" | "TBZ" | "TBNZ" => self.compare_and_branch(insn, builder)?,
            "BL" | "BLR" => {
                builder.emit(OpCode::Call, vec![self.call_target(insn)?]);
            }
            "BR" => {
                builder.emit(OpCode::CallNoReturn, vec![operand(insn, 0)?]);
            }
            "RET" => {
                builder.emit(OpCode::Return, vec![]);
            }
            "BRK" | "SVC" | "HLT" | "UDF" => {
                builder.emit(OpCode::Interrupt, vec![]);
            }
            "NOP" | "HINT" | "PACIASP" | "AUTIASP" | "PACIBSP" | "AUTIBSP" | "BTI" | "YIELD" => {}
            _ => return Err(no_rule(insn, "unrecognised mnemonic")),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{lift, LiftOptions};
    use super::*;
    use crate::decoder::Indexing;
    use crate::Architecture;

    const A64: Architecture = Architecture::ArmV8;

    #[test]
    fn test_pre_and_post_index_on_sp() {
        // stp x29, x30, [sp, #-16]!; ldp x29, x30, [sp], #16; ret
        let mut stp = insn(A64, 0x0, 4, "STP", vec![reg("X29"), reg("X30"), mem(Some("SP"), -16)]);
        stp.indexing = Indexing::PreIndex;
        let mut ldp = insn(A64, 0x4, 4, "LDP", vec![reg("X29"), reg("X30"), mem(Some("SP"), 0), imm(16)]);
        ldp.indexing = Indexing::PostIndex(16);
        let ret = insn(A64, 0x8, 4, "RET", vec![]);

        let statements = lift(A64, &[stp, ldp, ret], &LiftOptions::default()).unwrap();
        assert_eq!(
            opcodes(&statements),
            vec![
                OpCode::ShiftStack,
                OpCode::Move,
                OpCode::Move,
                OpCode::Move,
                OpCode::Move,
                OpCode::ShiftStack,
                OpCode::Return
            ]
        );
        assert_eq!(statements[0].operands, vec![IsilOperand::int(-16)]);
        assert_eq!(statements[5].operands, vec![IsilOperand::int(16)]);
        // second register of the pair lands one X register higher
        let IsilOperand::Memory(second) = &statements[2].operands[0] else {
            panic!("expected a memory destination");
        };
        assert_eq!(second.addend, 8);
    }

    #[test]
    fn test_sxtw_is_a_move() {
        let code = vec![insn(A64, 0x0, 4, "SXTW", vec![reg("X21"), reg("W20")])];
        let statements = lift(A64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::Move);
        assert_eq!(statements[0].operands, vec![IsilOperand::reg("X21"), IsilOperand::reg("W20")]);
    }

    #[test]
    fn test_cbz_and_tbnz() {
        let code = vec![
            insn(A64, 0x0, 4, "CBZ", vec![reg("X0"), imm(0xc)]),
            insn(A64, 0x4, 4, "TBNZ", vec![reg("W1"), imm(3), imm(0xc)]),
            insn(A64, 0x8, 4, "NOP", vec![]),
            insn(A64, 0xc, 4, "RET", vec![]),
        ];
        let statements = lift(A64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(
            opcodes(&statements),
            vec![
                OpCode::Compare,
                OpCode::JumpIfEqual,
                OpCode::And,
                OpCode::Compare,
                OpCode::JumpIfNotEqual,
                OpCode::Return
            ]
        );
        assert_eq!(statements[1].branch_target(), Some(5));
        assert_eq!(statements[2].operands[2], IsilOperand::int(8));
    }

    #[test]
    fn test_branch_kinds() {
        let code = vec![
            insn(A64, 0x0, 4, "B.NE", vec![imm(0x8)]),
            insn(A64, 0x4, 4, "BL", vec![imm(0x5000)]),
            insn(A64, 0x8, 4, "BR", vec![reg("X16")]),
        ];
        let statements = lift(A64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(
            opcodes(&statements),
            vec![OpCode::JumpIfNotEqual, OpCode::Call, OpCode::CallNoReturn]
        );
        assert_eq!(statements[0].branch_target(), Some(2));
    }

    #[test]
    fn test_literal_load_becomes_absolute_memory() {
        let code = vec![insn(A64, 0x0, 4, "LDR", vec![reg("X0"), imm(0x2000)])];
        let statements = lift(A64, &code, &LiftOptions::default()).unwrap();
        let IsilOperand::Memory(mem) = &statements[0].operands[1] else {
            panic!("expected memory source");
        };
        assert_eq!(mem.base, None);
        assert_eq!(mem.addend, 0x2000);
    }

    #[test]
    fn test_shifted_stack_adjust() {
        // sub sp, sp, #1, lsl #12; add sp, sp, #1, lsl #12; ret
        let mut sub = insn(A64, 0x0, 4, "SUB", vec![reg("SP"), reg("SP"), imm(1)]);
        sub.text = "sp, sp, #1, lsl #12".into();
        let mut add = insn(A64, 0x4, 4, "ADD", vec![reg("SP"), reg("SP"), imm(1)]);
        add.text = "sp, sp, #1, lsl #12".into();
        let ret = insn(A64, 0x8, 4, "RET", vec![]);

        let statements = lift(A64, &[sub, add, ret], &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::ShiftStack);
        assert_eq!(statements[0].operands, vec![IsilOperand::int(-4096)]);
        assert_eq!(statements[1].operands, vec![IsilOperand::int(4096)]);
    }

    #[test]
    fn test_shifted_arithmetic_immediate() {
        let mut add = insn(A64, 0x0, 4, "ADD", vec![reg("X0"), reg("X1"), imm(2)]);
        add.text = "x0, x1, #2, lsl #12".into();
        let statements = lift(A64, &[add], &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].operands[2], IsilOperand::int(0x2000));
    }

    #[test]
    fn test_movk_shift() {
        let mut movk = insn(A64, 0x0, 4, "MOVK", vec![reg("X0"), imm(0x1234)]);
        movk.text = "x0, #0x1234, lsl #16".into();
        let statements = lift(A64, &[movk], &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::Or);
        assert_eq!(statements[0].operands[2], IsilOperand::int(0x1234 << 16));
    }
}
