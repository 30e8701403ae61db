//! x86 (32/64-bit) lifting rules.

use super::{immediate, no_rule, operand, IsilBuilder, IsilOperand, Lifter, LiftError, OpCode, TEMP};
use crate::decoder::{Instruction, Operand};
use crate::Architecture;

pub(super) struct X86Lifter {
    width: i64,
    sp: &'static str,
    fp: &'static str,
    /// Bytes allocated below the frame pointer by the prologue
    frame: Option<i64>,
    /// Still inside the prologue that follows `mov rbp, rsp`
    measuring: bool,
}

impl X86Lifter {
    pub(super) fn new(arch: Architecture) -> Self {
        let (sp, fp) = match arch {
            Architecture::X86_32 => ("ESP", "EBP"),
            _ => ("RSP", "RBP"),
        };
        Self {
            width: arch.pointer_width() as i64,
            sp,
            fp,
            frame: None,
            measuring: false,
        }
    }

    fn is_reg(&self, op: Option<&Operand>, name: &str) -> bool {
        op.and_then(Operand::register) == Some(name)
    }

    /// Track the frame size between `mov rbp, rsp` and the first
    /// instruction that is not part of the prologue.
    fn measure(&mut self, insn: &Instruction) {
        if !self.measuring {
            return;
        }
        let grow = match insn.mnemonic.as_str() {
            "PUSH" => Some(self.width),
            "SUB" if self.is_reg(insn.operand(0), self.sp) => insn.operand(1).and_then(Operand::immediate),
            _ => None,
        };
        match (grow, self.frame.as_mut()) {
            (Some(bytes), Some(frame)) => *frame += bytes,
            _ => self.measuring = false,
        }
    }

    fn arithmetic(&self, insn: &Instruction, builder: &mut IsilBuilder, opcode: OpCode) -> Result<(), LiftError> {
        let dst = operand(insn, 0)?;
        let rhs = match insn.operand(1) {
            Some(_) => operand(insn, 1)?,
            // one-operand shift forms shift by one
            None => IsilOperand::int(1),
        };
        builder.emit(opcode, vec![dst.clone(), dst, rhs]);
        Ok(())
    }

    /// `DIV`/`IDIV`/`MUL` with the accumulator implied.
    fn accumulator(&self, insn: &Instruction, builder: &mut IsilBuilder, opcode: OpCode) -> Result<(), LiftError> {
        let acc = if self.width == 8 { "RAX" } else { "EAX" };
        let src = operand(insn, 0)?;
        builder.emit(opcode, vec![IsilOperand::reg(acc), IsilOperand::reg(acc), src]);
        Ok(())
    }
}

fn condition(mnemonic: &str) -> Option<OpCode> {
    Some(match mnemonic {
        "JE" | "JZ" => OpCode::JumpIfEqual,
        "JNE" | "JNZ" => OpCode::JumpIfNotEqual,
        "JG" | "JNLE" => OpCode::JumpIfGreater,
        "JGE" | "JNL" => OpCode::JumpIfGreaterOrEqual,
        "JL" | "JNGE" => OpCode::JumpIfLess,
        "JLE" | "JNG" => OpCode::JumpIfLessOrEqual,
        "JA" | "JNBE" => OpCode::JumpIfAbove,
        "JAE" | "JNB" | "JNC" => OpCode::JumpIfAboveOrEqual,
        "JB" | "JNAE" | "JC" => OpCode::JumpIfBelow,
        "JBE" | "JNA" => OpCode::JumpIfBelowOrEqual,
        _ => return None,
    })
}

impl Lifter for X86Lifter {
    fn lift(&mut self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        self.measure(insn);
        let mnemonic = insn.mnemonic.as_str();

        match mnemonic {
            "PUSH" => {
                builder.emit(OpCode::Push, vec![operand(insn, 0)?]);
            }
            "POP" => {
                builder.emit(OpCode::Pop, vec![operand(insn, 0)?]);
            }
            "MOV" | "MOVABS" | "MOVZX" | "MOVSX" | "MOVSXD" | "MOVSS" | "MOVSD" | "MOVAPS" | "MOVUPS"
            | "MOVAPD" | "MOVUPD" | "MOVDQA" | "MOVDQU" | "MOVD" | "MOVQ" => {
                let dst_sp = self.is_reg(insn.operand(0), self.sp);
                let src_sp = self.is_reg(insn.operand(1), self.sp);
                let dst_fp = self.is_reg(insn.operand(0), self.fp);
                let src_fp = self.is_reg(insn.operand(1), self.fp);

                if dst_fp && src_sp {
                    self.frame = Some(0);
                    self.measuring = true;
                } else if dst_sp && src_fp {
                    if let Some(frame) = self.frame {
                        builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(frame)]);
                        return Ok(());
                    }
                }
                builder.emit(OpCode::Move, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "LEA" => {
                builder.emit(OpCode::LoadAddress, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "ADD" | "SUB" if self.is_reg(insn.operand(0), self.sp) && insn.operand(1).and_then(Operand::immediate).is_some() => {
                let amount = immediate(insn, 1)?;
                let shift = if mnemonic == "SUB" { -amount } else { amount };
                builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(shift)]);
            }
            "XOR" if insn.operand(0).is_some() && insn.operand(0) == insn.operand(1) && insn.operand(0).and_then(Operand::register).is_some() => {
                builder.emit(OpCode::Move, vec![operand(insn, 0)?, IsilOperand::int(0)]);
            }
            "ADD" => self.arithmetic(insn, builder, OpCode::Add)?,
            "SUB" => self.arithmetic(insn, builder, OpCode::Subtract)?,
            "AND" => self.arithmetic(insn, builder, OpCode::And)?,
            "OR" => self.arithmetic(insn, builder, OpCode::Or)?,
            "XOR" => self.arithmetic(insn, builder, OpCode::Xor)?,
            "SHL" | "SAL" => self.arithmetic(insn, builder, OpCode::ShiftLeft)?,
            "SHR" | "SAR" => self.arithmetic(insn, builder, OpCode::ShiftRight)?,
            "IMUL" => match insn.operands.len() {
                1 => self.accumulator(insn, builder, OpCode::Multiply)?,
                2 => self.arithmetic(insn, builder, OpCode::Multiply)?,
                _ => {
                    builder.emit(OpCode::Multiply, vec![operand(insn, 0)?, operand(insn, 1)?, operand(insn, 2)?]);
                }
            },
            "MUL" => self.accumulator(insn, builder, OpCode::Multiply)?,
            "DIV" | "IDIV" => self.accumulator(insn, builder, OpCode::Divide)?,
            "INC" | "DEC" => {
                let dst = operand(insn, 0)?;
                let opcode = if mnemonic == "INC" { OpCode::Add } else { OpCode::Subtract };
                builder.emit(opcode, vec![dst.clone(), dst, IsilOperand::int(1)]);
            }
            "NOT" => {
                let dst = operand(insn, 0)?;
                builder.emit(OpCode::Not, vec![dst.clone(), dst]);
            }
            "NEG" => {
                let dst = operand(insn, 0)?;
                builder.emit(OpCode::Negate, vec![dst.clone(), dst]);
            }
            "CMP" => {
                builder.emit(OpCode::Compare, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "TEST" => {
                let lhs = operand(insn, 0)?;
                let rhs = operand(insn, 1)?;
                if lhs == rhs {
                    builder.emit(OpCode::Compare, vec![lhs, IsilOperand::int(0)]);
                } else {
                    builder.emit(OpCode::And, vec![IsilOperand::reg(TEMP), lhs, rhs]);
                    builder.emit(OpCode::Compare, vec![IsilOperand::reg(TEMP), IsilOperand::int(0)]);
                }
            }
            "JMP" => match insn.operand(0) {
                Some(Operand::Immediate(imm)) => {
                    let target = imm.as_i64().ok_or_else(|| no_rule(insn, "non-integer jump target"))?;
                    builder.branch(target as u64);
                }
                Some(_) => {
                    builder.emit(OpCode::CallNoReturn, vec![operand(insn, 0)?]);
                }
                None => return Err(no_rule(insn, "jump without target")),
            },
            "JRCXZ" | "JECXZ" | "JCXZ" => {
                let counter = match mnemonic {
                    "JRCXZ" => "RCX",
                    "JECXZ" => "ECX",
                    _ => "CX",
                };
                let target = immediate(insn, 0)? as u64;
                builder.emit(OpCode::Compare, vec![IsilOperand::reg(counter), IsilOperand::int(0)]);
                builder.conditional(OpCode::JumpIfEqual, target)?;
            }
            m if m.starts_with('J') => {
                let opcode = condition(m).ok_or_else(|| no_rule(insn, "condition has no ISIL comparison"))?;
                let target = immediate(insn, 0)? as u64;
                builder.conditional(opcode, target)?;
            }
            "CALL" => {
                let target = match insn.operand(0) {
                    Some(Operand::Immediate(imm)) => imm
                        .as_i64()
                        .map(|t| IsilOperand::address(t as u64))
                        .ok_or_else(|| no_rule(insn, "non-integer call target"))?,
                    _ => operand(insn, 0)?,
                };
                builder.emit(OpCode::Call, vec![target]);
            }
            "RET" | "RETN" | "RETF" => {
                // ret imm16: the callee pops its arguments after the return address
                if let Some(bytes) = insn.operand(0).and_then(Operand::immediate).filter(|b| *b != 0) {
                    builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(bytes)]);
                }
                builder.emit(OpCode::Return, vec![]);
            }
            "INT3" | "INT" | "INT1" | "INTO" | "UD2" | "HLT" => {
                builder.emit(OpCode::Interrupt, vec![]);
            }
            "NOP" | "ENDBR32" | "ENDBR64" | "FNOP" | "PAUSE" => {}
            "LEAVE" => {
                let frame = self
                    .frame
                    .ok_or_else(|| no_rule(insn, "leave without a measured frame"))?;
                builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(frame)]);
                builder.emit(OpCode::Pop, vec![IsilOperand::reg(self.fp)]);
            }
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

    const X64: Architecture = Architecture::X86_64;

    #[test]
    fn test_prologue_and_epilogue() {
        // push rbp; sub rsp, 0x20; add rsp, 0x20; pop rbp; ret
        let code = vec![
            insn(X64, 0x0, 1, "PUSH", vec![reg("RBP")]),
            insn(X64, 0x1, 4, "SUB", vec![reg("RSP"), imm(0x20)]),
            insn(X64, 0x5, 4, "ADD", vec![reg("RSP"), imm(0x20)]),
            insn(X64, 0x9, 1, "POP", vec![reg("RBP")]),
            insn(X64, 0xa, 1, "RET", vec![]),
        ];
        let statements = lift(X64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(
            opcodes(&statements),
            vec![OpCode::Push, OpCode::ShiftStack, OpCode::ShiftStack, OpCode::Pop, OpCode::Return]
        );
        assert_eq!(statements[1].operands, vec![IsilOperand::int(-0x20)]);
        assert_eq!(statements[2].operands, vec![IsilOperand::int(0x20)]);
    }

    #[test]
    fn test_leave_uses_measured_frame() {
        // push rbp; mov rbp, rsp; push rbx; sub rsp, 0x18; call f; leave; ret
        let code = vec![
            insn(X64, 0x0, 1, "PUSH", vec![reg("RBP")]),
            insn(X64, 0x1, 3, "MOV", vec![reg("RBP"), reg("RSP")]),
            insn(X64, 0x4, 1, "PUSH", vec![reg("RBX")]),
            insn(X64, 0x5, 4, "SUB", vec![reg("RSP"), imm(0x18)]),
            insn(X64, 0x9, 5, "CALL", vec![imm(0x4000)]),
            insn(X64, 0xe, 1, "LEAVE", vec![]),
            insn(X64, 0xf, 1, "RET", vec![]),
        ];
        let statements = lift(X64, &code, &LiftOptions::default()).unwrap();
        let leave: Vec<_> = statements.iter().filter(|s| s.address == 0xe).collect();
        assert_eq!(leave.len(), 2);
        assert_eq!(leave[0].opcode, OpCode::ShiftStack);
        assert_eq!(leave[0].operands, vec![IsilOperand::int(0x20)]);
        assert_eq!(leave[1].opcode, OpCode::Pop);
        assert_eq!(leave[1].operands, vec![IsilOperand::reg("RBP")]);
    }

    #[test]
    fn test_leave_without_frame_is_a_fault() {
        let code = vec![insn(X64, 0x0, 1, "LEAVE", vec![]), insn(X64, 0x1, 1, "RET", vec![])];
        assert!(matches!(
            lift(X64, &code, &LiftOptions::default()),
            Err(LiftError::NoRule { .. })
        ));
    }

    #[test]
    fn test_xor_self_and_test_forms() {
        let code = vec![
            insn(X64, 0x0, 2, "XOR", vec![reg("EAX"), reg("EAX")]),
            insn(X64, 0x2, 2, "TEST", vec![reg("ECX"), reg("ECX")]),
            insn(X64, 0x4, 2, "TEST", vec![reg("ECX"), reg("EDX")]),
            insn(X64, 0x6, 1, "RET", vec![]),
        ];
        let statements = lift(X64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::Move);
        assert_eq!(statements[0].operands, vec![IsilOperand::reg("EAX"), IsilOperand::int(0)]);
        assert_eq!(statements[1].operands, vec![IsilOperand::reg("ECX"), IsilOperand::int(0)]);
        assert_eq!(
            opcodes(&statements[2..4]),
            vec![OpCode::And, OpCode::Compare]
        );
        assert_eq!(statements[3].operands[0], IsilOperand::reg(TEMP));
    }

    #[test]
    fn test_conditional_jump_over_nop_resolves_to_next_statement() {
        // cmp eax, 1; jne 0x8; nop; ret
        let code = vec![
            insn(X64, 0x0, 3, "CMP", vec![reg("EAX"), imm(1)]),
            insn(X64, 0x3, 2, "JNE", vec![imm(0x7)]),
            insn(X64, 0x5, 2, "INC", vec![reg("EAX")]),
            insn(X64, 0x7, 1, "NOP", vec![]),
            insn(X64, 0x8, 1, "RET", vec![]),
        ];
        let statements = lift(X64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(statements[1].opcode, OpCode::JumpIfNotEqual);
        // the nop lifted to nothing, so the target is the ret
        assert_eq!(statements[1].branch_target(), Some(3));
        assert_eq!(statements[3].opcode, OpCode::Return);
    }

    #[test]
    fn test_jumps_leaving_the_routine() {
        let tail = vec![
            insn(X64, 0x0, 5, "JMP", vec![imm(0x9000)]),
        ];
        let statements = lift(X64, &tail, &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::CallNoReturn);

        let indirect = vec![insn(X64, 0x0, 2, "JMP", vec![reg("RAX")])];
        let statements = lift(X64, &indirect, &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::CallNoReturn);
        assert_eq!(statements[0].operands, vec![IsilOperand::reg("RAX")]);

        let conditional = vec![
            insn(X64, 0x0, 6, "JE", vec![imm(0x9000)]),
            insn(X64, 0x6, 1, "RET", vec![]),
        ];
        assert_eq!(
            lift(X64, &conditional, &LiftOptions::default()).unwrap_err(),
            LiftError::ExternalConditionalJump { address: 0, target: 0x9000 }
        );
    }

    #[test]
    fn test_unmapped_condition_is_no_rule() {
        let code = vec![insn(X64, 0x0, 2, "JS", vec![imm(0x2)]), insn(X64, 0x2, 1, "RET", vec![])];
        assert!(matches!(lift(X64, &code, &LiftOptions::default()), Err(LiftError::NoRule { .. })));
    }

    #[test]
    fn test_unsigned_conditions_stay_unsigned() {
        // cmp eax, 1; ja 0x7; jg 0x7; ret
        let code = vec![
            insn(X64, 0x0, 3, "CMP", vec![reg("EAX"), imm(1)]),
            insn(X64, 0x3, 2, "JA", vec![imm(0x7)]),
            insn(X64, 0x5, 2, "JG", vec![imm(0x7)]),
            insn(X64, 0x7, 1, "RET", vec![]),
        ];
        let statements = lift(X64, &code, &LiftOptions::default()).unwrap();
        assert_eq!(statements[1].opcode, OpCode::JumpIfAbove);
        assert_eq!(statements[2].opcode, OpCode::JumpIfGreater);

        for (mnemonic, expected) in [
            ("JAE", OpCode::JumpIfAboveOrEqual),
            ("JB", OpCode::JumpIfBelow),
            ("JBE", OpCode::JumpIfBelowOrEqual),
            ("JL", OpCode::JumpIfLess),
        ] {
            assert_eq!(condition(mnemonic), Some(expected), "{}", mnemonic);
        }
    }

    #[test]
    fn test_ret_with_immediate_releases_arguments() {
        // push ebp; pop ebp; ret 8
        let code = vec![
            insn(Architecture::X86_32, 0x0, 1, "PUSH", vec![reg("EBP")]),
            insn(Architecture::X86_32, 0x1, 1, "POP", vec![reg("EBP")]),
            insn(Architecture::X86_32, 0x2, 3, "RET", vec![imm(8)]),
        ];
        let statements = lift(Architecture::X86_32, &code, &LiftOptions::default()).unwrap();
        assert_eq!(
            opcodes(&statements),
            vec![OpCode::Push, OpCode::Pop, OpCode::ShiftStack, OpCode::Return]
        );
        assert_eq!(statements[2].operands, vec![IsilOperand::int(8)]);
        assert_eq!(statements[2].address, statements[3].address);
    }

    #[test]
    fn test_x86_32_uses_esp() {
        let code = vec![
            insn(Architecture::X86_32, 0x0, 3, "SUB", vec![reg("ESP"), imm(8)]),
            insn(Architecture::X86_32, 0x3, 1, "RET", vec![]),
        ];
        let statements = lift(Architecture::X86_32, &code, &LiftOptions::default()).unwrap();
        assert_eq!(statements[0].opcode, OpCode::ShiftStack);
        assert_eq!(statements[0].operands, vec![IsilOperand::int(-8)]);
    }
}
