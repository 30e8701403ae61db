//! Instruction-set-independent lifting (ISIL).
//!
//! Native instructions of every supported architecture are lifted into one
//! flat statement list. Branches are emitted against native addresses first
//! and rewritten into statement indices by [`fix_jumps`] once the whole
//! routine has been lifted.

mod arm;
mod arm64;
pub mod rewrite;
mod wasm;
mod x86;

use std::fmt;
use std::ops::Range;

use crate::decoder::{Immediate, Instruction, MemoryOperand, Operand};
use crate::{Address, Architecture};

pub use self::rewrite::{apply_rewrites, LiteralLookup, LiteralRewrite, LiteralTable, PostLiftRewrite};

/// Scratch register used when one native instruction needs an intermediate
/// result (`TEST a, b`, `TBZ`, WASM stack operands).
pub const TEMP: &str = "TEMP";

/// Errors raised while lifting a routine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiftError {
    /// The native instruction has no ISIL translation
    #[error("no lifting rule for `{instruction}` at 0x{address:x}: {reason}")]
    NoRule {
        address: Address,
        instruction: String,
        reason: String,
    },

    /// An operand shape the rule cannot express
    #[error("unsupported operand in `{instruction}` at 0x{address:x}: {reason}")]
    UnsupportedOperand {
        address: Address,
        instruction: String,
        reason: String,
    },

    /// A branch whose target is not the start of any lifted instruction
    #[error("branch at 0x{address:x} targets 0x{target:x}, which starts no statement")]
    UnresolvedJump { address: Address, target: Address },

    /// A conditional branch leaving the routine's byte range
    #[error("conditional branch at 0x{address:x} leaves the routine (target 0x{target:x})")]
    ExternalConditionalJump { address: Address, target: Address },

    /// Parameter/result counts are unknown for a WASM call site
    #[error("missing arity for {what} at 0x{address:x}")]
    MissingArity { address: Address, what: String },

    /// Unbalanced WASM structured control flow
    #[error("malformed control structure at 0x{address:x}: {reason}")]
    MalformedStructure { address: Address, reason: String },
}

/// Closed set of ISIL opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Move,
    LoadAddress,
    Add,
    Subtract,
    Multiply,
    Divide,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
    Xor,
    Not,
    Negate,
    Compare,
    Push,
    Pop,
    ShiftStack,
    Call,
    CallNoReturn,
    Return,
    Jump,
    JumpIfEqual,
    JumpIfNotEqual,
    JumpIfGreater,
    JumpIfGreaterOrEqual,
    JumpIfLess,
    JumpIfLessOrEqual,
    /// Unsigned greater-than
    JumpIfAbove,
    JumpIfAboveOrEqual,
    /// Unsigned less-than
    JumpIfBelow,
    JumpIfBelowOrEqual,
    Interrupt,
    NotImplemented,
}

impl OpCode {
    pub fn is_conditional_jump(&self) -> bool {
        matches!(
            self,
            OpCode::JumpIfEqual
                | OpCode::JumpIfNotEqual
                | OpCode::JumpIfGreater
                | OpCode::JumpIfGreaterOrEqual
                | OpCode::JumpIfLess
                | OpCode::JumpIfLessOrEqual
                | OpCode::JumpIfAbove
                | OpCode::JumpIfAboveOrEqual
                | OpCode::JumpIfBelow
                | OpCode::JumpIfBelowOrEqual
        )
    }

    /// Opcodes whose first operand is a branch target.
    pub fn is_jump(&self) -> bool {
        *self == OpCode::Jump || self.is_conditional_jump()
    }

    /// Opcodes that end a basic block.
    pub fn transfers_control(&self) -> bool {
        self.is_jump()
            || matches!(
                self,
                OpCode::Call | OpCode::CallNoReturn | OpCode::Return | OpCode::Interrupt
            )
    }

    /// Whether operand `position` is only read. Destinations, `Pop` targets
    /// and branch or call targets are not.
    pub fn reads_operand(&self, position: usize) -> bool {
        match self {
            OpCode::Move
            | OpCode::LoadAddress
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::ShiftLeft
            | OpCode::ShiftRight
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Not
            | OpCode::Negate
            | OpCode::Pop => position > 0,
            OpCode::Compare | OpCode::Push | OpCode::ShiftStack => true,
            OpCode::Call | OpCode::CallNoReturn => position > 0,
            _ if self.is_jump() => position > 0,
            _ => false,
        }
    }

    /// The opposite condition (`JumpIfLess` for `JumpIfGreaterOrEqual`).
    pub fn inverted(&self) -> Option<OpCode> {
        Some(match self {
            OpCode::JumpIfEqual => OpCode::JumpIfNotEqual,
            OpCode::JumpIfNotEqual => OpCode::JumpIfEqual,
            OpCode::JumpIfGreater => OpCode::JumpIfLessOrEqual,
            OpCode::JumpIfGreaterOrEqual => OpCode::JumpIfLess,
            OpCode::JumpIfLess => OpCode::JumpIfGreaterOrEqual,
            OpCode::JumpIfLessOrEqual => OpCode::JumpIfGreater,
            OpCode::JumpIfAbove => OpCode::JumpIfBelowOrEqual,
            OpCode::JumpIfAboveOrEqual => OpCode::JumpIfBelow,
            OpCode::JumpIfBelow => OpCode::JumpIfAboveOrEqual,
            OpCode::JumpIfBelowOrEqual => OpCode::JumpIfAbove,
            _ => return None,
        })
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immediate payload of an ISIL operand.
#[derive(Debug, Clone, PartialEq)]
pub enum IsilValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    /// Symbolic literal, e.g. a resolved string
    Literal(String),
}

impl IsilValue {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            IsilValue::Int(v) => Some(v),
            IsilValue::Uint(v) => Some(v as i64),
            _ => None,
        }
    }
}

impl From<Immediate> for IsilValue {
    fn from(imm: Immediate) -> Self {
        match imm {
            Immediate::Signed(v) => IsilValue::Int(v),
            Immediate::Unsigned(v) => IsilValue::Uint(v),
            Immediate::F32(v) => IsilValue::Float(f64::from(v)),
            Immediate::F64(v) => IsilValue::Float(v),
        }
    }
}

impl fmt::Display for IsilValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilValue::Int(v) if (-9..=9).contains(v) => write!(f, "{}", v),
            IsilValue::Int(v) if *v < 0 => write!(f, "-0x{:x}", v.unsigned_abs()),
            IsilValue::Int(v) => write!(f, "0x{:x}", v),
            IsilValue::Uint(v) => write!(f, "0x{:x}", v),
            IsilValue::Float(v) => write!(f, "{}", v),
            IsilValue::Literal(s) => write!(f, "\"{}\"", s.escape_debug()),
        }
    }
}

/// One operand of an ISIL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum IsilOperand {
    /// Logical upper-case register name
    Register(String),
    Immediate(IsilValue),
    Memory(MemoryOperand),
    /// Offset relative to the stack pointer at routine entry
    StackOffset(i64),
    /// Resolved branch target
    Statement(usize),
}

impl IsilOperand {
    pub fn reg(name: impl Into<String>) -> Self {
        IsilOperand::Register(name.into())
    }

    pub fn int(value: i64) -> Self {
        IsilOperand::Immediate(IsilValue::Int(value))
    }

    /// An unresolved branch target, by native address.
    pub fn address(target: Address) -> Self {
        IsilOperand::Immediate(IsilValue::Uint(target))
    }

    pub fn register(&self) -> Option<&str> {
        match self {
            IsilOperand::Register(name) => Some(name),
            _ => None,
        }
    }

    pub fn statement(&self) -> Option<usize> {
        match self {
            IsilOperand::Statement(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Translate a native operand. Raw byte payloads have no ISIL form.
    pub fn from_native(operand: &Operand, insn: &Instruction) -> Result<Self, LiftError> {
        match operand {
            Operand::Register(name) => Ok(IsilOperand::Register(name.clone())),
            Operand::Immediate(imm) => Ok(IsilOperand::Immediate((*imm).into())),
            Operand::Memory(mem) => Ok(IsilOperand::Memory(mem.clone())),
            Operand::Bytes(_) => Err(LiftError::UnsupportedOperand {
                address: insn.ip,
                instruction: insn.to_string(),
                reason: "raw byte operand".into(),
            }),
        }
    }
}

impl fmt::Display for IsilOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilOperand::Register(name) => f.write_str(name),
            IsilOperand::Immediate(value) => write!(f, "{}", value),
            IsilOperand::Memory(mem) => {
                let mut parts = Vec::new();
                if let Some(base) = &mem.base {
                    parts.push(base.clone());
                }
                if let Some(index) = &mem.index {
                    if mem.scale > 1 {
                        parts.push(format!("{}*{}", index, mem.scale));
                    } else {
                        parts.push(index.clone());
                    }
                }
                let mut text = parts.join("+");
                if mem.addend != 0 || text.is_empty() {
                    if text.is_empty() {
                        text = format!("0x{:x}", mem.addend);
                    } else if mem.addend < 0 {
                        text.push_str(&format!("-0x{:x}", mem.addend.unsigned_abs()));
                    } else {
                        text.push_str(&format!("+0x{:x}", mem.addend));
                    }
                }
                write!(f, "[{}]", text)
            }
            IsilOperand::StackOffset(offset) if *offset < 0 => write!(f, "stack[-0x{:x}]", offset.unsigned_abs()),
            IsilOperand::StackOffset(offset) => write!(f, "stack[0x{:x}]", offset),
            IsilOperand::Statement(idx) => write!(f, "@{}", idx),
        }
    }
}

/// One ISIL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct IsilStatement {
    /// Position within the routine's statement list
    pub index: usize,
    /// Address of the native instruction this statement came from
    pub address: Address,
    pub opcode: OpCode,
    pub operands: Vec<IsilOperand>,
}

impl IsilStatement {
    /// Resolved branch target of a jump statement.
    pub fn branch_target(&self) -> Option<usize> {
        if self.opcode.is_jump() {
            self.operands.first().and_then(IsilOperand::statement)
        } else {
            None
        }
    }
}

impl fmt::Display for IsilStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.index, self.opcode)?;
        for (n, operand) in self.operands.iter().enumerate() {
            let sep = if n == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, operand)?;
        }
        Ok(())
    }
}

/// What to do with a native instruction that has no lifting rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownInstructionPolicy {
    /// Abort the routine with [`LiftError::NoRule`]
    #[default]
    Strict,
    /// Emit a `NotImplemented` statement carrying the native text
    Placeholder,
}

/// Parameter and result counts of a WASM function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WasmSignature {
    pub params: usize,
    pub results: usize,
}

impl WasmSignature {
    pub fn new(params: usize, results: usize) -> Self {
        Self { params, results }
    }
}

/// Module-level information the WASM lifter cannot recover from a code body.
#[derive(Debug, Clone, Default)]
pub struct WasmContext {
    /// Result count of the routine being lifted
    pub results: usize,
    /// Signature of every function, by function index
    pub function_signatures: Vec<WasmSignature>,
    /// Signature of every type, by type index (`call_indirect`)
    pub type_signatures: Vec<WasmSignature>,
}

/// Lifter configuration.
#[derive(Debug, Clone, Default)]
pub struct LiftOptions {
    pub unknown: UnknownInstructionPolicy,
    pub wasm: WasmContext,
}

/// Per-architecture instruction lifter.
trait Lifter {
    fn lift(&mut self, insn: &Instruction, builder: &mut IsilBuilder) -> Result<(), LiftError>;
}

/// Accumulates statements and remembers where each native instruction began.
pub struct IsilBuilder {
    range: Range<Address>,
    statements: Vec<IsilStatement>,
    remap: JumpRemap,
    address: Address,
}

impl IsilBuilder {
    pub fn new(range: Range<Address>) -> Self {
        Self {
            address: range.start,
            range,
            statements: Vec::new(),
            remap: JumpRemap::default(),
        }
    }

    fn begin(&mut self, insn: &Instruction) {
        self.address = insn.ip;
        self.remap.addresses.push(insn.ip);
        self.remap.starts.push(self.statements.len());
    }

    /// Drop everything emitted for the current native instruction.
    fn rollback(&mut self) {
        if let Some(&start) = self.remap.starts.last() {
            self.statements.truncate(start);
        }
    }

    /// Index of the native instruction being lifted.
    pub fn native_index(&self) -> usize {
        self.remap.addresses.len().saturating_sub(1)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.range.contains(&address)
    }

    pub fn emit(&mut self, opcode: OpCode, operands: Vec<IsilOperand>) -> usize {
        let index = self.statements.len();
        self.statements.push(IsilStatement {
            index,
            address: self.address,
            opcode,
            operands,
        });
        index
    }

    /// Unconditional direct branch: a jump inside the routine, a tail call
    /// outside it.
    pub fn branch(&mut self, target: Address) {
        if self.contains(target) {
            self.emit(OpCode::Jump, vec![IsilOperand::address(target)]);
        } else {
            self.emit(OpCode::CallNoReturn, vec![IsilOperand::address(target)]);
        }
    }

    pub fn conditional(&mut self, opcode: OpCode, target: Address) -> Result<(), LiftError> {
        if !self.contains(target) {
            return Err(LiftError::ExternalConditionalJump {
                address: self.address,
                target,
            });
        }
        self.emit(opcode, vec![IsilOperand::address(target)]);
        Ok(())
    }

    /// Conditional jump over the statements emitted until [`IsilBuilder::land`]
    /// is called with the returned index.
    pub fn skip(&mut self, opcode: OpCode) -> usize {
        self.emit(opcode, vec![IsilOperand::Statement(usize::MAX)])
    }

    /// Point the skip emitted at `from` to the next statement.
    pub fn land(&mut self, from: usize) {
        let here = self.statements.len();
        if let Some(stmt) = self.statements.get_mut(from) {
            stmt.operands = vec![IsilOperand::Statement(here)];
        }
    }

    /// Run the fix-up pass and hand out the finished statement list.
    pub fn finish(mut self) -> Result<Vec<IsilStatement>, LiftError> {
        fix_jumps(&mut self.statements, &self.remap)?;
        Ok(self.statements)
    }
}

/// Native address → native index → first statement index.
#[derive(Debug, Clone, Default)]
pub struct JumpRemap {
    addresses: Vec<Address>,
    starts: Vec<usize>,
}

impl JumpRemap {
    /// First statement emitted at or after the native instruction at
    /// `target`. Instructions that lifted to nothing resolve to the next
    /// emitted statement.
    pub fn resolve(&self, target: Address, statement_count: usize) -> Option<usize> {
        let native = self.addresses.binary_search(&target).ok()?;
        let start = self.starts[native];
        (start < statement_count).then_some(start)
    }
}

/// Rewrite every address-valued branch operand into `Statement(index)`.
///
/// Already-resolved operands are left alone, so the pass is idempotent.
pub fn fix_jumps(statements: &mut [IsilStatement], remap: &JumpRemap) -> Result<(), LiftError> {
    let count = statements.len();
    let mut resolved = 0usize;

    for stmt in statements.iter_mut() {
        if !stmt.opcode.is_jump() {
            continue;
        }
        let Some(IsilOperand::Immediate(value)) = stmt.operands.first() else {
            continue;
        };
        let Some(target) = value.as_i64().map(|v| v as Address) else {
            continue;
        };
        let index = remap.resolve(target, count).ok_or(LiftError::UnresolvedJump {
            address: stmt.address,
            target,
        })?;
        stmt.operands[0] = IsilOperand::Statement(index);
        resolved += 1;
    }

    if resolved > 0 {
        log::debug!("resolved {} branch target(s) over {} statements", resolved, count);
    }
    Ok(())
}

/// Lift a decoded routine into ISIL.
///
/// # Arguments
/// * `arch` - Architecture of the instructions
/// * `instructions` - The routine body, contiguous and in address order
/// * `options` - Unknown-instruction policy and WASM module context
///
/// # Returns
/// The statement list with every branch resolved to a statement index
pub fn lift(
    arch: Architecture,
    instructions: &[Instruction],
    options: &LiftOptions,
) -> Result<Vec<IsilStatement>, LiftError> {
    let (Some(first), Some(last)) = (instructions.first(), instructions.last()) else {
        return Ok(Vec::new());
    };
    let mut builder = IsilBuilder::new(first.ip..last.next_ip);

    let mut lifter: Box<dyn Lifter + '_> = match arch {
        Architecture::X86_32 | Architecture::X86_64 => Box::new(x86::X86Lifter::new(arch)),
        Architecture::ArmV7 => Box::new(arm::ArmLifter::new()),
        Architecture::ArmV8 => Box::new(arm64::Arm64Lifter::new()),
        Architecture::Wasm => Box::new(wasm::WasmLifter::new(instructions, &options.wasm)?),
    };

    for insn in instructions {
        builder.begin(insn);
        match lifter.lift(insn, &mut builder) {
            Ok(()) => {}
            Err(LiftError::NoRule { reason, .. })
                if options.unknown == UnknownInstructionPolicy::Placeholder =>
            {
                log::debug!("placeholder for `{}` at 0x{:x}: {}", insn, insn.ip, reason);
                builder.rollback();
                builder.emit(
                    OpCode::NotImplemented,
                    vec![IsilOperand::Immediate(IsilValue::Literal(insn.to_string()))],
                );
            }
            Err(e) => return Err(e),
        }
    }

    let statements = builder.finish()?;
    log::debug!(
        "lifted {} {} instructions into {} statements",
        instructions.len(),
        arch,
        statements.len()
    );
    Ok(statements)
}

/// Shorthand for the common "no rule" fault.
pub(crate) fn no_rule(insn: &Instruction, reason: impl Into<String>) -> LiftError {
    LiftError::NoRule {
        address: insn.ip,
        instruction: insn.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn unsupported(insn: &Instruction, reason: impl Into<String>) -> LiftError {
    LiftError::UnsupportedOperand {
        address: insn.ip,
        instruction: insn.to_string(),
        reason: reason.into(),
    }
}

/// Operand `n` of `insn`, translated.
pub(crate) fn operand(insn: &Instruction, n: usize) -> Result<IsilOperand, LiftError> {
    let op = insn
        .operand(n)
        .ok_or_else(|| unsupported(insn, format!("missing operand {}", n)))?;
    IsilOperand::from_native(op, insn)
}

/// Immediate operand `n` of `insn`.
pub(crate) fn immediate(insn: &Instruction, n: usize) -> Result<i64, LiftError> {
    insn.operand(n)
        .and_then(Operand::immediate)
        .ok_or_else(|| unsupported(insn, format!("operand {} is not an immediate", n)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::decoder::{Indexing, Mnemonic};

    /// Hand-built native instruction so lifter tests do not depend on
    /// decoder rendering.
    pub fn insn(arch: Architecture, ip: Address, size: usize, mnemonic: &str, operands: Vec<Operand>) -> Instruction {
        let text = operands
            .iter()
            .map(|op| match op {
                Operand::Register(r) => r.clone(),
                Operand::Immediate(imm) => imm.as_i64().map(|v| format!("{:#x}", v)).unwrap_or_default(),
                Operand::Memory(m) => format!("[{:?}+{:#x}]", m.base, m.addend),
                Operand::Bytes(b) => format!("{:?}", b),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Instruction {
            arch,
            ip,
            next_ip: ip + size as Address,
            mnemonic: Mnemonic::Machine(mnemonic.to_string()),
            operands,
            bytes: vec![0x90; size],
            text,
            indexing: Indexing::Offset,
        }
    }

    pub fn reg(name: &str) -> Operand {
        Operand::Register(name.to_string())
    }

    pub fn imm(value: i64) -> Operand {
        Operand::Immediate(Immediate::Signed(value))
    }

    pub fn mem(base: Option<&str>, addend: i64) -> Operand {
        Operand::Memory(MemoryOperand {
            base: base.map(str::to_string),
            index: None,
            scale: 1,
            addend,
        })
    }

    pub fn opcodes(statements: &[IsilStatement]) -> Vec<OpCode> {
        statements.iter().map(|s| s.opcode).collect()
    }
}
