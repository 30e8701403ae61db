//! Capstone-based decoders for x86, ARMv7 and ARMv8.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use capstone::arch::arm::{ArmOperand, ArmOperandType};
use capstone::arch::arm64::{Arm64Operand, Arm64OperandType};
use capstone::arch::x86::{X86Operand, X86OperandType};
use capstone::arch::arm::ArchMode as ArmMode;
use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::*;
use capstone::RegId;

use super::{DecodeError, Immediate, Indexing, Instruction, MemoryOperand, Mnemonic, Operand};
use crate::reader::ByteReader;
use crate::{Address, Architecture};

/// Longest x86 encoding.
const MAX_X86_INSTRUCTION: usize = 15;

thread_local! {
    // Capstone handles are not shareable across threads, so each worker
    // keeps its own, built on first use.
    static CS_POOL: RefCell<HashMap<Architecture, Rc<Capstone>>> = RefCell::new(HashMap::new());
}

/// Build a Capstone handle with instruction details enabled.
fn build(arch: Architecture) -> Result<Capstone, DecodeError> {
    let cs = match arch {
        Architecture::X86_32 => Capstone::new().x86().mode(X86Mode::Mode32).detail(true).build(),
        Architecture::X86_64 => Capstone::new().x86().mode(X86Mode::Mode64).detail(true).build(),
        Architecture::ArmV7 => Capstone::new().arm().mode(ArmMode::Arm).detail(true).build(),
        Architecture::ArmV8 => Capstone::new().arm64().mode(Arm64Mode::Arm).detail(true).build(),
        Architecture::Wasm => {
            return Err(DecodeError::Capstone(format!("no capstone backend for {}", arch)));
        }
    };
    cs.map_err(|e| DecodeError::Capstone(e.to_string()))
}

fn with_capstone<T>(
    arch: Architecture,
    f: impl FnOnce(&Capstone) -> Result<T, DecodeError>,
) -> Result<T, DecodeError> {
    let cs = CS_POOL.with(|cell| -> Result<Rc<Capstone>, DecodeError> {
        let mut pool = cell.borrow_mut();
        if let Some(cs) = pool.get(&arch) {
            return Ok(Rc::clone(cs));
        }
        let cs = Rc::new(build(arch)?);
        pool.insert(arch, Rc::clone(&cs));
        Ok(cs)
    })?;
    f(&cs)
}

/// Capstone-backed decoder for one machine architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineDecoder {
    arch: Architecture,
}

impl MachineDecoder {
    pub fn new(arch: Architecture) -> Self {
        Self { arch }
    }

    /// Slice of `code` Capstone should look at for the instruction at `offset`.
    fn window<'a>(&self, code: &'a [u8], base: Address, offset: usize) -> Result<&'a [u8], DecodeError> {
        let available = code.len().saturating_sub(offset);
        match self.arch.fixed_width() {
            Some(width) => {
                let mut reader = ByteReader::at(code, offset);
                reader.read_bytes(width).map_err(|_| DecodeError::Truncated {
                    arch: self.arch,
                    address: base + offset as Address,
                    offset,
                    needed: width,
                    available,
                })
            }
            None => {
                if available == 0 {
                    return Err(DecodeError::Truncated {
                        arch: self.arch,
                        address: base + offset as Address,
                        offset,
                        needed: 1,
                        available,
                    });
                }
                Ok(&code[offset..offset + available.min(MAX_X86_INSTRUCTION)])
            }
        }
    }
}

impl super::Decoder for MachineDecoder {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn decode(&self, code: &[u8], base: Address, offset: usize) -> Result<Instruction, DecodeError> {
        let window = self.window(code, base, offset)?;
        let address = base + offset as Address;
        let arch = self.arch;

        with_capstone(arch, |cs| {
            let invalid = || DecodeError::InvalidInstruction {
                arch,
                address,
                offset,
                bytes: window.to_vec(),
            };

            let insns = cs.disasm_count(window, address, 1).map_err(|_| invalid())?;
            let insn = insns.as_ref().first().ok_or_else(invalid)?;
            if insn.address() != address {
                return Err(invalid());
            }

            let bytes = insn.bytes().to_vec();
            let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_uppercase();
            let text = insn.op_str().unwrap_or("").to_string();
            let next_ip = address + bytes.len() as Address;

            let detail = cs
                .insn_detail(insn)
                .map_err(|e| DecodeError::Capstone(e.to_string()))?;
            let arch_detail = detail.arch_detail();

            let reg = |id: RegId| -> Option<String> {
                if id.0 == 0 {
                    return None;
                }
                cs.reg_name(id).map(|name| name.to_ascii_uppercase())
            };

            // Operand kinds no lifter consumes (system registers, barriers,
            // prefetch hints) are dropped here.
            let operands: Vec<Operand> = if let Some(x86) = arch_detail.x86() {
                x86.operands().filter_map(|op| convert_x86(&op, next_ip, &reg)).collect()
            } else if let Some(arm) = arch_detail.arm() {
                arm.operands().filter_map(|op| convert_arm(&op, &reg)).collect()
            } else if let Some(arm64) = arch_detail.arm64() {
                arm64.operands().filter_map(|op| convert_arm64(&op, &reg)).collect()
            } else {
                Vec::new()
            };

            let indexing = indexing_of(&text, &operands);

            Ok(Instruction {
                arch,
                ip: address,
                next_ip,
                mnemonic: Mnemonic::Machine(mnemonic),
                operands,
                bytes,
                text,
                indexing,
            })
        })
    }
}

fn convert_x86(op: &X86Operand, next_ip: Address, reg: &dyn Fn(RegId) -> Option<String>) -> Option<Operand> {
    match &op.op_type {
        X86OperandType::Reg(id) => reg(*id).map(Operand::Register),
        X86OperandType::Imm(value) => Some(Operand::Immediate(Immediate::Signed(*value))),
        X86OperandType::Mem(mem) => {
            let base = reg(mem.base());
            let index = reg(mem.index());
            // RIP-relative operands become absolute addresses.
            if matches!(base.as_deref(), Some("RIP") | Some("EIP")) {
                return Some(Operand::Memory(MemoryOperand {
                    base: None,
                    index,
                    scale: mem.scale(),
                    addend: next_ip.wrapping_add(mem.disp() as u64) as i64,
                }));
            }
            Some(Operand::Memory(MemoryOperand {
                base,
                index,
                scale: mem.scale(),
                addend: mem.disp(),
            }))
        }
        _ => None,
    }
}

fn convert_arm(op: &ArmOperand, reg: &dyn Fn(RegId) -> Option<String>) -> Option<Operand> {
    match &op.op_type {
        ArmOperandType::Reg(id) => reg(*id).map(Operand::Register),
        ArmOperandType::Imm(value) => Some(Operand::Immediate(Immediate::Signed(i64::from(*value)))),
        ArmOperandType::Mem(mem) => {
            let disp = i64::from(mem.disp());
            Some(Operand::Memory(MemoryOperand {
                base: reg(mem.base()),
                index: reg(mem.index()),
                scale: mem.scale(),
                addend: if op.subtracted { -disp } else { disp },
            }))
        }
        ArmOperandType::Fp(value) => Some(Operand::Immediate(Immediate::F64(*value))),
        _ => None,
    }
}

fn convert_arm64(op: &Arm64Operand, reg: &dyn Fn(RegId) -> Option<String>) -> Option<Operand> {
    match &op.op_type {
        Arm64OperandType::Reg(id) => reg(*id).map(Operand::Register),
        Arm64OperandType::Imm(value) | Arm64OperandType::Cimm(value) => {
            Some(Operand::Immediate(Immediate::Signed(*value)))
        }
        Arm64OperandType::Mem(mem) => Some(Operand::Memory(MemoryOperand {
            base: reg(mem.base()),
            index: reg(mem.index()),
            scale: 1,
            addend: i64::from(mem.disp()),
        })),
        Arm64OperandType::Fp(value) => Some(Operand::Immediate(Immediate::F64(*value))),
        _ => None,
    }
}

/// Recover ARM pre/post-index addressing from the rendered operand text.
///
/// `[sp, #-16]!` is pre-indexed; `[sp], #16` is post-indexed by 16.
fn indexing_of(text: &str, operands: &[Operand]) -> Indexing {
    if text.ends_with('!') && text.contains('[') {
        return Indexing::PreIndex;
    }
    let Some(close) = text.rfind(']') else {
        return Indexing::Offset;
    };
    let tail = text[close + 1..].trim_start_matches(',').trim();
    if tail.is_empty() {
        return Indexing::Offset;
    }
    // Capstone reports the post-increment as the trailing immediate.
    if let Some(Operand::Immediate(imm)) = operands.last() {
        if let Some(value) = imm.as_i64() {
            return Indexing::PostIndex(value);
        }
    }
    parse_arm_immediate(tail).map(Indexing::PostIndex).unwrap_or(Indexing::Offset)
}

/// Parse `#0x10`, `#-0x10` or `#16`.
fn parse_arm_immediate(s: &str) -> Option<i64> {
    let s = s.trim().trim_start_matches('#');
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}
