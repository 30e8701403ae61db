//! ARMv7 (ARM mode) lifting rules, plus the load/store and condition-code
//! helpers shared with AArch64.

use super::{immediate, no_rule, operand, unsupported, IsilBuilder, IsilOperand, Lifter, LiftError, OpCode};
use crate::decoder::{Indexing, Instruction, MemoryOperand, Operand};

const CONDITIONS: [&str; 17] = [
    "EQ", "NE", "CS", "HS", "CC", "LO", "MI", "PL", "VS", "VC", "HI", "LS", "GE", "LT", "GT", "LE", "AL",
];

/// Base mnemonics, longest first so `BLX` wins over `BL` and `B`.
const BASES: &[&str] = &[
    "STMDB", "STMFD", "STMIA", "LDMIA", "LDMFD", "LDRSB", "LDRSH",
    "PUSH", "MOVW", "MOVT", "SDIV", "UDIV", "LDRB", "LDRH", "LDRD", "STRB", "STRH", "STRD", "BKPT",
    "POP", "MOV", "MVN", "ADD", "ADC", "SUB", "SBC", "RSB", "MUL", "AND", "ORR", "EOR", "BIC", "LSL",
    "LSR", "ASR", "ROR", "CMP", "CMN", "TST", "TEQ", "LDM", "STM", "LDR", "STR", "BLX", "SVC", "UDF",
    "NOP",
    "BL", "BX",
    "B",
];

/// Branch opcode for a condition code. `AL` is an unconditional jump;
/// overflow conditions have no ISIL comparison.
pub(super) fn condition_opcode(cc: &str) -> Option<OpCode> {
    Some(match cc {
        "EQ" => OpCode::JumpIfEqual,
        "NE" => OpCode::JumpIfNotEqual,
        "GT" => OpCode::JumpIfGreater,
        "GE" | "PL" => OpCode::JumpIfGreaterOrEqual,
        "LT" | "MI" => OpCode::JumpIfLess,
        "LE" => OpCode::JumpIfLessOrEqual,
        "HI" => OpCode::JumpIfAbove,
        "HS" | "CS" => OpCode::JumpIfAboveOrEqual,
        "LO" | "CC" => OpCode::JumpIfBelow,
        "LS" => OpCode::JumpIfBelowOrEqual,
        "AL" | "" => OpCode::Jump,
        _ => return None,
    })
}

/// Split `ADDSEQ` into (`ADD`, `EQ`, sets-flags).
fn split_mnemonic(mnemonic: &str) -> Option<(&'static str, &str, bool)> {
    BASES.iter().copied().find_map(|base| {
        let rest = mnemonic.strip_prefix(base)?;
        let branch = base.starts_with('B') && base != "BIC" && base != "BKPT";
        let (flags, cc) = match rest.strip_prefix('S') {
            Some(cc) if !branch => (true, cc),
            _ => (false, rest),
        };
        (cc.is_empty() || CONDITIONS.contains(&cc)).then_some((base, cc, flags))
    })
}

/// Byte size of an ARM register.
pub(super) fn register_size(name: &str) -> i64 {
    match name.chars().next() {
        Some('X') | Some('D') => 8,
        Some('W') | Some('S') => 4,
        Some('Q') => 16,
        Some('H') => 2,
        Some('B') => 1,
        _ => 4,
    }
}

fn writeback(builder: &mut IsilBuilder, base: Option<&str>, amount: i64) {
    match base {
        Some("SP") => {
            builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(amount)]);
        }
        Some(reg) => {
            builder.emit(
                OpCode::Add,
                vec![IsilOperand::reg(reg), IsilOperand::reg(reg), IsilOperand::int(amount)],
            );
        }
        None => {}
    }
}

/// Lift a single or paired load/store, including pre/post-index writeback.
///
/// Consecutive registers occupy consecutive memory, each sized by
/// `size_of`.
pub(super) fn transfer(
    insn: &Instruction,
    builder: &mut IsilBuilder,
    registers: &[String],
    load: bool,
    size_of: fn(&str) -> i64,
) -> Result<(), LiftError> {
    let mem = match insn.operands.iter().find_map(Operand::memory) {
        Some(mem) => mem.clone(),
        // literal-pool load: `ldr x0, #0x1000`
        None if load => MemoryOperand {
            base: None,
            index: None,
            scale: 1,
            addend: immediate(insn, registers.len())?,
        },
        None => return Err(unsupported(insn, "store without a memory operand")),
    };

    let base = mem.base.clone();
    let (access, after) = match insn.indexing {
        Indexing::Offset => (mem, None),
        Indexing::PreIndex => {
            writeback(builder, base.as_deref(), mem.addend);
            (MemoryOperand { addend: 0, ..mem }, None)
        }
        Indexing::PostIndex(n) => (MemoryOperand { addend: 0, ..mem }, Some(n)),
    };

    let mut offset = 0;
    for reg in registers {
        let slot = IsilOperand::Memory(MemoryOperand {
            addend: access.addend + offset,
            ..access.clone()
        });
        let reg_op = IsilOperand::reg(reg.as_str());
        if load {
            builder.emit(OpCode::Move, vec![reg_op, slot]);
        } else {
            builder.emit(OpCode::Move, vec![slot, reg_op]);
        }
        offset += size_of(reg);
    }

    if let Some(n) = after {
        writeback(builder, base.as_deref(), n);
    }
    Ok(())
}

/// Leading register operands of `insn`.
pub(super) fn leading_registers(insn: &Instruction, count: usize) -> Result<Vec<String>, LiftError> {
    (0..count)
        .map(|n| {
            insn.operand(n)
                .and_then(Operand::register)
                .map(str::to_string)
                .ok_or_else(|| unsupported(insn, format!("operand {} is not a register", n)))
        })
        .collect()
}

/// Two- or three-operand arithmetic, normalised to `dst, lhs, rhs`.
pub(super) fn three_operand(insn: &Instruction, builder: &mut IsilBuilder, opcode: OpCode) -> Result<(), LiftError> {
    let dst = operand(insn, 0)?;
    let (lhs, rhs) = if insn.operands.len() >= 3 {
        (operand(insn, 1)?, shifted_immediate(insn, 2)?)
    } else {
        (dst.clone(), shifted_immediate(insn, 1)?)
    };
    builder.emit(opcode, vec![dst, lhs, rhs]);
    Ok(())
}

/// Operand `n`, with an immediate scaled by a trailing `lsl #n`.
fn shifted_immediate(insn: &Instruction, n: usize) -> Result<IsilOperand, LiftError> {
    match insn.operand(n).and_then(Operand::immediate) {
        Some(value) => Ok(IsilOperand::int(value << lsl_suffix(&insn.text))),
        None => operand(insn, n),
    }
}

/// `ADD`/`SUB sp, sp, #imm{, lsl #12}`.
pub(super) fn stack_adjust(insn: &Instruction) -> Option<i64> {
    let is_sp = |n| insn.operand(n).and_then(Operand::register) == Some("SP");
    if is_sp(0) && is_sp(1) {
        insn.operand(2)
            .and_then(Operand::immediate)
            .map(|value| value << lsl_suffix(&insn.text))
    } else {
        None
    }
}

/// Shift amount of a `MOVK`/`MOVT`-style `lsl #n` suffix.
pub(super) fn lsl_suffix(text: &str) -> i64 {
    text.rsplit_once("lsl #")
        .and_then(|(_, n)| n.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

pub(super) struct ArmLifter;

impl ArmLifter {
    pub(super) fn new() -> Self {
        Self
    }

    fn register_list(&self, insn: &Instruction, skip: usize) -> Result<Vec<String>, LiftError> {
        insn.operands
            .iter()
            .skip(skip)
            .map(|op| {
                op.register()
                    .map(str::to_string)
                    .ok_or_else(|| unsupported(insn, "register list holds a non-register"))
            })
            .collect()
    }

    fn push(&self, builder: &mut IsilBuilder, registers: &[String]) {
        // highest register lands at the highest address, so it goes first
        for reg in registers.iter().rev() {
            builder.emit(OpCode::Push, vec![IsilOperand::reg(reg.as_str())]);
        }
    }

    fn pop(&self, builder: &mut IsilBuilder, registers: &[String]) {
        for reg in registers {
            builder.emit(OpCode::Pop, vec![IsilOperand::reg(reg.as_str())]);
        }
        if registers.iter().any(|r| r == "PC") {
            builder.emit(OpCode::Return, vec![]);
        }
    }

    /// Whether `insn` writes SP or PC, which cannot be conditionally executed
    /// without splitting the block.
    fn touches_stack_or_pc(&self, base: &str, insn: &Instruction) -> bool {
        let writes = |name: &str| insn.operand(0).and_then(Operand::register) == Some(name);
        matches!(base, "PUSH" | "POP" | "STMDB" | "STMFD" | "LDMIA" | "LDMFD" | "LDM" | "STM" | "STMIA")
            || writes("SP")
            || writes("PC")
            || (insn.indexing != Indexing::Offset
                && insn.operands.iter().any(|op| op.memory().is_some_and(|m| m.base.as_deref() == Some("SP"))))
    }
}

impl Lifter for ArmLifter {
    fn lift(&mut self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        let (base, cc, _flags) =
            split_mnemonic(insn.mnemonic.as_str()).ok_or_else(|| no_rule(insn, "unrecognised mnemonic"))?;
        let conditional = !cc.is_empty() && cc != "AL";

        if conditional && !matches!(base, "B" | "BL" | "BLX") && self.touches_stack_or_pc(base, insn) {
            return Err(no_rule(insn, "conditionally executed stack or pc update"));
        }

        match base {
            "PUSH" => self.push(builder, &self.register_list(insn, 0)?),
            "POP" => self.pop(builder, &self.register_list(insn, 0)?),
            "STMDB" | "STMFD" | "LDMIA" | "LDMFD" | "LDM" | "STM" | "STMIA"
                if insn.operand(0).and_then(Operand::register) == Some("SP") && insn.text.contains('!') =>
            {
                let registers = self.register_list(insn, 1)?;
                if base.starts_with("ST") {
                    self.push(builder, &registers);
                } else {
                    self.pop(builder, &registers);
                }
            }
            "MOV" | "MOVW" => {
                builder.emit(OpCode::Move, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "MOVT" => {
                let dst = operand(insn, 0)?;
                let high = immediate(insn, 1)? << 16;
                builder.emit(OpCode::Or, vec![dst.clone(), dst, IsilOperand::int(high)]);
            }
            "MVN" => {
                builder.emit(OpCode::Not, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "ADD" | "SUB" if stack_adjust(insn).is_some() => {
                let amount = stack_adjust(insn).unwrap_or(0);
                let shift = if base == "SUB" { -amount } else { amount };
                builder.emit(OpCode::ShiftStack, vec![IsilOperand::int(shift)]);
            }
            "ADD" | "ADC" => three_operand(insn, builder, OpCode::Add)?,
            "SUB" | "SBC" => three_operand(insn, builder, OpCode::Subtract)?,
            "RSB" => {
                // reverse subtract: dst = rhs - lhs
                let dst = operand(insn, 0)?;
                let lhs = operand(insn, 1)?;
                let rhs = operand(insn, 2)?;
                builder.emit(OpCode::Subtract, vec![dst, rhs, lhs]);
            }
            "MUL" => three_operand(insn, builder, OpCode::Multiply)?,
            "SDIV" | "UDIV" => three_operand(insn, builder, OpCode::Divide)?,
            "AND" => three_operand(insn, builder, OpCode::And)?,
            "ORR" => three_operand(insn, builder, OpCode::Or)?,
            "EOR" => three_operand(insn, builder, OpCode::Xor)?,
            "LSL" => three_operand(insn, builder, OpCode::ShiftLeft)?,
            "LSR" | "ASR" => three_operand(insn, builder, OpCode::ShiftRight)?,
            "CMP" | "CMN" | "TST" | "TEQ" => {
                builder.emit(OpCode::Compare, vec![operand(insn, 0)?, operand(insn, 1)?]);
            }
            "LDR" | "LDRB" | "LDRH" | "LDRSB" | "LDRSH" | "LDRD" => {
                let count = if base == "LDRD" { 2 } else { 1 };
                let registers = leading_registers(insn, count)?;
                transfer(insn, builder, &registers, true, |_| 4)?;
                if registers.iter().any(|r| r == "PC") {
                    builder.emit(OpCode::Return, vec![]);
                }
            }
            "STR" | "STRB" | "STRH" | "STRD" => {
                let count = if base == "STRD" { 2 } else { 1 };
                let registers = leading_registers(insn, count)?;
                transfer(insn, builder, &registers, false, |_| 4)?;
            }
            "B" => {
                let target = immediate(insn, 0)? as u64;
                let opcode = condition_opcode(cc).ok_or_else(|| no_rule(insn, "overflow condition"))?;
                if opcode == OpCode::Jump {
                    builder.branch(target);
                } else {
                    builder.conditional(opcode, target)?;
                }
            }
            "BL" | "BLX" => {
                let target = match insn.operand(0) {
                    Some(Operand::Immediate(imm)) => IsilOperand::address(imm.as_i64().unwrap_or(0) as u64),
                    _ => operand(insn, 0)?,
                };
                builder.emit(OpCode::Call, vec![target]);
            }
            "BX" => {
                if conditional {
                    return Err(no_rule(insn, "conditional indirect branch"));
                }
                if insn.operand(0).and_then(Operand::register) == Some("LR") {
                    builder.emit(OpCode::Return, vec![]);
                } else {
                    builder.emit(OpCode::CallNoReturn, vec![operand(insn, 0)?]);
                }
            }
            "SVC" | "BKPT" | "UDF" => {
                builder.emit(OpCode::Interrupt, vec![]);
            }
            "NOP" => {}
            _ => return Err(no_rule(insn, "unrecognised mnemonic")),
        }

        Ok(())
    }
}
