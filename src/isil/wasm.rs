//! WebAssembly lifting rules.
//!
//! The operand stack is made explicit with `Push`/`Pop` statements, and
//! structured control flow is flattened into jumps. A pre-pass pairs every
//! `block`/`loop`/`if` with its `else` and `end` so that label depths can be
//! turned into native branch targets.
//!
//! The lifter also tracks the operand-stack height. A taken branch leaves
//! exactly the target label's values on top of the label's entry height, so
//! `br`, `br_if`, `br_table` and `return` pop whatever sits in between before
//! jumping.

use std::collections::HashMap;

use super::{
    immediate, no_rule, IsilBuilder, IsilOperand, IsilValue, Lifter, LiftError, OpCode, WasmContext, WasmSignature,
    TEMP,
};
use crate::decoder::wasm::OpClass;
use crate::decoder::{Instruction, MemoryOperand, Mnemonic, WasmOpcode};
use crate::Address;

const TEMP2: &str = "TEMP2";
const TEMP3: &str = "TEMP3";

/// Block type immediate of a block producing nothing (`0x40`).
const EMPTY_BLOCK_TYPE: i64 = -0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Block,
    Loop,
    If,
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    opener: usize,
    else_at: Option<usize>,
    end: usize,
    signature: WasmSignature,
    /// Operand-stack height below the frame's parameters, set when the
    /// opener is lifted
    height: usize,
}

/// Where a branch lands and what it carries.
#[derive(Debug, Clone, Copy)]
struct Label {
    target: Address,
    height: usize,
    arity: usize,
}

pub(super) struct WasmLifter<'a> {
    instructions: &'a [Instruction],
    context: &'a WasmContext,
    frames: Vec<Frame>,
    /// Native index of an opener → its frame
    frame_of: HashMap<usize, usize>,
    /// Native index of the `end` closing the function body
    function_end: usize,
    /// Frames entered and not yet closed while lifting
    open: Vec<usize>,
    height: usize,
    /// Cleared after an unconditional transfer until the next `else`/`end`
    reachable: bool,
}

fn opcode_of(insn: &Instruction) -> Result<WasmOpcode, LiftError> {
    match insn.mnemonic {
        Mnemonic::Wasm(op) => Ok(op),
        Mnemonic::Machine(_) => Err(no_rule(insn, "not a WebAssembly instruction")),
    }
}

fn malformed(insn: &Instruction, reason: &str) -> LiftError {
    LiftError::MalformedStructure {
        address: insn.ip,
        reason: reason.to_string(),
    }
}

fn temp(name: &str) -> IsilOperand {
    IsilOperand::reg(name)
}

/// Register holding the `n`th value a branch carries across an unwind.
fn carry(n: usize) -> IsilOperand {
    IsilOperand::reg(format!("CARRY{}", n))
}

/// Parameter and result counts of a `block`/`loop`/`if` block type.
fn block_signature(insn: &Instruction, context: &WasmContext) -> Result<WasmSignature, LiftError> {
    let raw = immediate(insn, 0)?;
    match raw {
        EMPTY_BLOCK_TYPE => Ok(WasmSignature::new(0, 0)),
        // i32, i64, f32, f64, v128
        -5..=-1 => Ok(WasmSignature::new(0, 1)),
        // funcref, externref
        -17 | -16 => Ok(WasmSignature::new(0, 1)),
        index if index >= 0 => usize::try_from(index)
            .ok()
            .and_then(|i| context.type_signatures.get(i))
            .copied()
            .ok_or_else(|| LiftError::MissingArity {
                address: insn.ip,
                what: format!("block type {}", index),
            }),
        _ => Err(malformed(insn, "unknown block type")),
    }
}

impl<'a> WasmLifter<'a> {
    pub(super) fn new(instructions: &'a [Instruction], context: &'a WasmContext) -> Result<Self, LiftError> {
        let mut frames: Vec<Frame> = Vec::new();
        let mut frame_of = HashMap::new();
        let mut stack: Vec<usize> = Vec::new();
        let mut function_end = None;

        for (i, insn) in instructions.iter().enumerate() {
            if function_end.is_some() {
                return Err(malformed(insn, "instruction after the function's final end"));
            }
            let kind = match opcode_of(insn)? {
                WasmOpcode::Block => Some(FrameKind::Block),
                WasmOpcode::Loop => Some(FrameKind::Loop),
                WasmOpcode::If => Some(FrameKind::If),
                WasmOpcode::Else => {
                    let id = stack
                        .last()
                        .copied()
                        .filter(|&id| frames[id].kind == FrameKind::If && frames[id].else_at.is_none())
                        .ok_or_else(|| malformed(insn, "else without a matching if"))?;
                    frames[id].else_at = Some(i);
                    None
                }
                WasmOpcode::End => {
                    match stack.pop() {
                        Some(id) => frames[id].end = i,
                        None => function_end = Some(i),
                    }
                    None
                }
                _ => None,
            };

            if let Some(kind) = kind {
                frame_of.insert(i, frames.len());
                stack.push(frames.len());
                frames.push(Frame {
                    kind,
                    opener: i,
                    else_at: None,
                    end: i,
                    signature: block_signature(insn, context)?,
                    height: 0,
                });
            }
        }

        let function_end = match (function_end, instructions.last()) {
            (Some(end), _) => end,
            (None, Some(last)) => return Err(malformed(last, "function body is not terminated by end")),
            (None, None) => 0,
        };

        Ok(Self {
            instructions,
            context,
            frames,
            frame_of,
            function_end,
            open: Vec::new(),
            height: 0,
            reachable: true,
        })
    }

    fn ip(&self, native: usize) -> Address {
        self.instructions[native].ip
    }

    fn function_label(&self) -> Label {
        Label {
            target: self.ip(self.function_end),
            height: 0,
            arity: self.context.results,
        }
    }

    /// Resolve label `depth`. A loop label lands on the loop header and
    /// carries the loop's parameters, any other label lands on the frame's
    /// `end` and carries its results.
    fn label(&self, insn: &Instruction, depth: i64) -> Result<Label, LiftError> {
        let depth = usize::try_from(depth).map_err(|_| malformed(insn, "negative label depth"))?;
        if depth == self.open.len() {
            return Ok(self.function_label());
        }
        let id = self
            .open
            .len()
            .checked_sub(depth + 1)
            .map(|slot| self.open[slot])
            .ok_or_else(|| malformed(insn, "label depth exceeds nesting"))?;
        let frame = &self.frames[id];
        Ok(match frame.kind {
            FrameKind::Loop => Label {
                target: self.ip(frame.opener),
                height: frame.height,
                arity: frame.signature.params,
            },
            FrameKind::Block | FrameKind::If => Label {
                target: self.ip(frame.end),
                height: frame.height,
                arity: frame.signature.results,
            },
        })
    }

    fn push(&mut self, builder: &mut IsilBuilder, operand: IsilOperand) {
        builder.emit(OpCode::Push, vec![operand]);
        self.height += 1;
    }

    fn pop(&mut self, builder: &mut IsilBuilder, operand: IsilOperand) {
        builder.emit(OpCode::Pop, vec![operand]);
        self.height = self.height.saturating_sub(1);
    }

    fn pop_n(&mut self, builder: &mut IsilBuilder, count: usize) {
        for _ in 0..count {
            self.pop(builder, temp(TEMP));
        }
    }

    fn push_n(&mut self, builder: &mut IsilBuilder, count: usize) {
        for _ in 0..count {
            self.push(builder, temp(TEMP));
        }
    }

    /// Values between the label's entry height and the values it carries.
    fn surplus(&self, label: &Label) -> usize {
        if self.reachable {
            self.height.saturating_sub(label.height + label.arity)
        } else {
            0
        }
    }

    /// Emit the pops a taken branch to `label` performs. The tracked height
    /// is left alone: it still describes the fall-through path.
    fn unwind(&self, builder: &mut IsilBuilder, label: &Label) {
        let surplus = self.surplus(label);
        if surplus == 0 {
            return;
        }
        for n in 0..label.arity {
            builder.emit(OpCode::Pop, vec![carry(n)]);
        }
        for _ in 0..surplus {
            builder.emit(OpCode::Pop, vec![temp(TEMP3)]);
        }
        for n in (0..label.arity).rev() {
            builder.emit(OpCode::Push, vec![carry(n)]);
        }
    }

    /// Unconditional branch to `label`, unwinding first.
    fn take(&self, builder: &mut IsilBuilder, label: &Label) {
        self.unwind(builder, label);
        builder.emit(OpCode::Jump, vec![IsilOperand::address(label.target)]);
    }

    /// Compare `TEMP` with `value` and branch to `label` when `opcode` holds.
    fn branch_if(
        &self,
        insn: &Instruction,
        builder: &mut IsilBuilder,
        opcode: OpCode,
        value: i64,
        label: &Label,
    ) -> Result<(), LiftError> {
        builder.emit(OpCode::Compare, vec![temp(TEMP), IsilOperand::int(value)]);
        if self.surplus(label) == 0 {
            return builder.conditional(opcode, label.target);
        }
        let inverted = opcode
            .inverted()
            .ok_or_else(|| no_rule(insn, "branch condition has no inverse"))?;
        let skip = builder.skip(inverted);
        self.take(builder, label);
        builder.land(skip);
        Ok(())
    }

    fn function_return(&mut self, builder: &mut IsilBuilder) {
        self.pop_n(builder, self.context.results);
        builder.emit(OpCode::Return, vec![]);
    }

    fn enter(&mut self, insn: &Instruction, native: usize) -> Result<usize, LiftError> {
        let id = self
            .frame_of
            .get(&native)
            .copied()
            .ok_or_else(|| malformed(insn, "unpaired block"))?;
        let frame = &mut self.frames[id];
        frame.height = self.height.saturating_sub(frame.signature.params);
        self.open.push(id);
        Ok(id)
    }

    fn binary_opcode(&self, op: WasmOpcode) -> Option<OpCode> {
        let name = op.name();
        let operation = name.split_once('.').map(|(_, rest)| rest).unwrap_or(name);
        Some(match operation {
            "add" => OpCode::Add,
            "sub" => OpCode::Subtract,
            "mul" => OpCode::Multiply,
            o if o.starts_with("div") || o.starts_with("rem") => OpCode::Divide,
            "and" => OpCode::And,
            "or" => OpCode::Or,
            "xor" => OpCode::Xor,
            "shl" | "rotl" => OpCode::ShiftLeft,
            o if o.starts_with("shr") || o == "rotr" => OpCode::ShiftRight,
            _ => return None,
        })
    }

    fn control(&mut self, op: WasmOpcode, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        let native = builder.native_index();

        match op {
            WasmOpcode::Unreachable => {
                builder.emit(OpCode::Interrupt, vec![]);
                self.reachable = false;
            }
            WasmOpcode::Nop => {}
            WasmOpcode::Block | WasmOpcode::Loop => {
                self.enter(insn, native)?;
            }
            WasmOpcode::If => {
                self.pop(builder, temp(TEMP));
                let id = self.enter(insn, native)?;
                let frame = &self.frames[id];
                // false path: the first instruction after `else`, or the `end`
                let target = match frame.else_at {
                    Some(else_at) => self.ip(else_at + 1),
                    None => self.ip(frame.end),
                };
                builder.emit(OpCode::Compare, vec![temp(TEMP), IsilOperand::int(0)]);
                builder.conditional(OpCode::JumpIfEqual, target)?;
            }
            WasmOpcode::Else => {
                let id = *self.open.last().ok_or_else(|| malformed(insn, "else outside if"))?;
                let frame = &self.frames[id];
                builder.emit(OpCode::Jump, vec![IsilOperand::address(self.ip(frame.end))]);
                self.height = frame.height + frame.signature.params;
                self.reachable = true;
            }
            WasmOpcode::End => match self.open.pop() {
                Some(id) => {
                    let frame = &self.frames[id];
                    if !self.reachable {
                        self.height = frame.height + frame.signature.results;
                    }
                    self.reachable = true;
                }
                None => self.function_return(builder),
            },
            WasmOpcode::Br => {
                let label = self.label(insn, immediate(insn, 0)?)?;
                self.take(builder, &label);
                self.reachable = false;
            }
            WasmOpcode::BrIf => {
                let label = self.label(insn, immediate(insn, 0)?)?;
                self.pop(builder, temp(TEMP));
                self.branch_if(insn, builder, OpCode::JumpIfNotEqual, 0, &label)?;
            }
            WasmOpcode::BrTable => {
                let labels = insn
                    .operands
                    .iter()
                    .map(|op| op.immediate().ok_or_else(|| malformed(insn, "non-integer label")))
                    .collect::<Result<Vec<_>, _>>()?;
                let (default, cases) = labels.split_last().ok_or_else(|| malformed(insn, "empty label table"))?;

                self.pop(builder, temp(TEMP));
                for (case, depth) in cases.iter().enumerate() {
                    let label = self.label(insn, *depth)?;
                    self.branch_if(insn, builder, OpCode::JumpIfEqual, case as i64, &label)?;
                }
                let label = self.label(insn, *default)?;
                self.take(builder, &label);
                self.reachable = false;
            }
            WasmOpcode::Return => {
                let label = self.function_label();
                self.unwind(builder, &label);
                self.function_return(builder);
                self.reachable = false;
            }
            WasmOpcode::Call => {
                let index = immediate(insn, 0)?;
                let signature = usize::try_from(index)
                    .ok()
                    .and_then(|i| self.context.function_signatures.get(i))
                    .copied()
                    .ok_or_else(|| LiftError::MissingArity {
                        address: insn.ip,
                        what: format!("function {}", index),
                    })?;
                self.pop_n(builder, signature.params);
                builder.emit(OpCode::Call, vec![IsilOperand::Immediate(IsilValue::Uint(index as u64))]);
                self.push_n(builder, signature.results);
            }
            WasmOpcode::CallIndirect => {
                let type_index = immediate(insn, 0)?;
                let signature = usize::try_from(type_index)
                    .ok()
                    .and_then(|i| self.context.type_signatures.get(i))
                    .copied()
                    .ok_or_else(|| LiftError::MissingArity {
                        address: insn.ip,
                        what: format!("type {}", type_index),
                    })?;
                // table slot first, then the arguments
                self.pop(builder, temp(TEMP2));
                self.pop_n(builder, signature.params);
                builder.emit(OpCode::Call, vec![temp(TEMP2)]);
                self.push_n(builder, signature.results);
            }
            _ => return Err(no_rule(insn, "unhandled control instruction")),
        }
        Ok(())
    }

    fn memarg(&self, insn: &Instruction) -> Result<MemoryOperand, LiftError> {
        Ok(MemoryOperand {
            base: Some(TEMP.to_string()),
            index: None,
            scale: 1,
            addend: immediate(insn, 1)?,
        })
    }
}

impl Lifter for WasmLifter<'_> {
    fn lift(&mut self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError> {
        let op = opcode_of(insn)?;

        match op.class() {
            OpClass::Control => self.control(op, insn, builder)?,
            OpClass::Parametric => match op {
                WasmOpcode::Drop => {
                    self.pop(builder, temp(TEMP));
                }
                _ => {
                    // select: condition, second value, first value
                    self.pop(builder, temp(TEMP3));
                    self.pop(builder, temp(TEMP2));
                    self.pop(builder, temp(TEMP));
                    self.push(builder, temp(TEMP));
                }
            },
            OpClass::Variable => {
                let index = immediate(insn, 0)?;
                let slot = match op {
                    WasmOpcode::GlobalGet | WasmOpcode::GlobalSet => IsilOperand::reg(format!("GLOBAL{}", index)),
                    _ => IsilOperand::reg(format!("LOCAL{}", index)),
                };
                match op {
                    WasmOpcode::LocalGet | WasmOpcode::GlobalGet => {
                        self.push(builder, slot);
                    }
                    WasmOpcode::LocalTee => {
                        self.pop(builder, slot.clone());
                        self.push(builder, slot);
                    }
                    _ => {
                        self.pop(builder, slot);
                    }
                }
            }
            OpClass::Const => {
                let value = insn
                    .operand(0)
                    .and_then(|op| match op {
                        crate::decoder::Operand::Immediate(imm) => Some(IsilValue::from(*imm)),
                        _ => None,
                    })
                    .ok_or_else(|| no_rule(insn, "constant without an immediate"))?;
                self.push(builder, IsilOperand::Immediate(value));
            }
            OpClass::Load => {
                let mem = self.memarg(insn)?;
                self.pop(builder, temp(TEMP));
                builder.emit(OpCode::Move, vec![temp(TEMP), IsilOperand::Memory(mem)]);
                self.push(builder, temp(TEMP));
            }
            OpClass::Store => {
                let mem = self.memarg(insn)?;
                self.pop(builder, temp(TEMP2));
                self.pop(builder, temp(TEMP));
                builder.emit(OpCode::Move, vec![IsilOperand::Memory(mem), temp(TEMP2)]);
            }
            OpClass::Memory => match op {
                WasmOpcode::MemorySize => {
                    self.push(builder, temp(TEMP));
                }
                WasmOpcode::MemoryGrow => {
                    self.pop(builder, temp(TEMP));
                    self.push(builder, temp(TEMP));
                }
                // memory.copy / memory.fill: three operands, no result
                _ => self.pop_n(builder, 3),
            },
            OpClass::Test => {
                self.pop(builder, temp(TEMP));
                builder.emit(OpCode::Compare, vec![temp(TEMP), IsilOperand::int(0)]);
                self.push(builder, temp(TEMP));
            }
            OpClass::Compare => {
                self.pop(builder, temp(TEMP2));
                self.pop(builder, temp(TEMP));
                builder.emit(OpCode::Compare, vec![temp(TEMP), temp(TEMP2)]);
                self.push(builder, temp(TEMP));
            }
            OpClass::Unary | OpClass::Convert => {
                self.pop(builder, temp(TEMP));
                builder.emit(OpCode::Move, vec![temp(TEMP), temp(TEMP)]);
                self.push(builder, temp(TEMP));
            }
            OpClass::Binary => {
                let opcode = self
                    .binary_opcode(op)
                    .ok_or_else(|| no_rule(insn, "binary operator has no ISIL equivalent"))?;
                self.pop(builder, temp(TEMP2));
                self.pop(builder, temp(TEMP));
                builder.emit(opcode, vec![temp(TEMP), temp(TEMP), temp(TEMP2)]);
                self.push(builder, temp(TEMP));
            }
        }
        Ok(())
    }
}
