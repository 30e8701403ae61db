//! Per-ISA decoders producing architecture-native instruction records.
//!
//! x86 and ARM encodings are decoded through Capstone ([`machine`]), WebAssembly
//! bytecode through a table-driven decoder ([`wasm`]). Both produce the same
//! [`Instruction`] shape, so the lifter never sees decoder-specific types.

pub mod machine;
pub mod wasm;

use std::fmt;

use crate::reader::ReadError;
use crate::{Address, Architecture};

pub use self::machine::MachineDecoder;
pub use self::wasm::{WasmDecoder, WasmOpcode};

/// Errors that can occur during decoding
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Bytes that do not form a valid instruction for this ISA
    #[error("invalid {arch} instruction at 0x{address:x} (offset {offset}): bytes {}", hex_bytes(.bytes))]
    InvalidInstruction {
        arch: Architecture,
        address: Address,
        offset: usize,
        bytes: Vec<u8>,
    },

    /// Opcode value outside the known table
    #[error("unknown {arch} opcode 0x{opcode:x} at 0x{address:x} (offset {offset})")]
    UnknownOpcode {
        arch: Architecture,
        opcode: u32,
        address: Address,
        offset: usize,
    },

    /// The span ended in the middle of an instruction
    #[error("truncated {arch} instruction at 0x{address:x} (offset {offset}): {available} of {needed} byte(s) available")]
    Truncated {
        arch: Architecture,
        address: Address,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Malformed operand encoding (e.g. an overflowing varint)
    #[error("malformed operand for {mnemonic} at 0x{address:x} (offset {offset}): {source}")]
    MalformedOperand {
        mnemonic: String,
        address: Address,
        offset: usize,
        #[source]
        source: ReadError,
    },

    /// Capstone could not be initialised
    #[error("capstone error: {0}")]
    Capstone(String),
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Width-typed immediate value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    Signed(i64),
    Unsigned(u64),
    F32(f32),
    F64(f64),
}

impl Immediate {
    /// Integer view of the immediate, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Immediate::Signed(v) => Some(v),
            Immediate::Unsigned(v) => Some(v as i64),
            Immediate::F32(_) | Immediate::F64(_) => None,
        }
    }
}

/// `[base + index * scale + addend]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryOperand {
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: i32,
    pub addend: i64,
}

/// One operand of a native instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Register, by upper-case logical name (`X21`, `RSP`, `R4`)
    Register(String),
    Immediate(Immediate),
    Memory(MemoryOperand),
    /// Raw encoded payload (e.g. `br_table` label vectors, block types)
    Bytes(Vec<u8>),
}

impl Operand {
    pub fn register(&self) -> Option<&str> {
        match self {
            Operand::Register(name) => Some(name),
            _ => None,
        }
    }

    pub fn immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(imm) => imm.as_i64(),
            _ => None,
        }
    }

    pub fn memory(&self) -> Option<&MemoryOperand> {
        match self {
            Operand::Memory(mem) => Some(mem),
            _ => None,
        }
    }
}

/// Base-register update performed by an ARM memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Indexing {
    /// `[base, #off]`
    #[default]
    Offset,
    /// `[base, #off]!`, the base is updated before the access
    PreIndex,
    /// `[base], #off`, the base is updated by `off` after the access
    PostIndex(i64),
}

/// Instruction name, drawn from a closed per-architecture set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mnemonic {
    /// Capstone instruction name, upper-cased (`SXTW`, `PUSH`, `B.EQ`)
    Machine(String),
    Wasm(WasmOpcode),
}

impl Mnemonic {
    pub fn as_str(&self) -> &str {
        match self {
            Mnemonic::Machine(name) => name,
            Mnemonic::Wasm(op) => op.name(),
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for Mnemonic {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// One decoded native instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub arch: Architecture,
    /// Address of the instruction
    pub ip: Address,
    /// Address of the following instruction
    pub next_ip: Address,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// Operand text as rendered by the decoder
    pub text: String,
    pub indexing: Indexing,
}

impl Instruction {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn operand(&self, n: usize) -> Option<&Operand> {
        self.operands.get(n)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.text)
        }
    }
}

/// Decoder trait: one instruction at a byte offset of a routine body.
pub trait Decoder: Send + Sync {
    fn architecture(&self) -> Architecture;

    /// Decode the instruction starting at `offset` within `code`, where
    /// `code[0]` lives at virtual address `base`.
    fn decode(&self, code: &[u8], base: Address, offset: usize) -> Result<Instruction, DecodeError>;
}

/// Bulk decode output.
#[derive(Debug, Clone)]
pub struct Disassembly {
    pub base: Address,
    pub instructions: Vec<Instruction>,
}

impl Disassembly {
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Total encoded size of all decoded instructions.
    pub fn byte_len(&self) -> usize {
        self.instructions.iter().map(Instruction::size).sum()
    }
}

/// The four supported decoders behind one closed variant.
#[derive(Debug, Clone)]
pub enum Disassembler {
    X86(MachineDecoder),
    ArmV7(MachineDecoder),
    ArmV8(MachineDecoder),
    Wasm(WasmDecoder),
}

impl Disassembler {
    /// Create the decoder for a specific architecture
    pub fn for_architecture(arch: Architecture) -> Self {
        match arch {
            Architecture::X86_32 | Architecture::X86_64 => {
                Disassembler::X86(MachineDecoder::new(arch))
            }
            Architecture::ArmV7 => Disassembler::ArmV7(MachineDecoder::new(arch)),
            Architecture::ArmV8 => Disassembler::ArmV8(MachineDecoder::new(arch)),
            Architecture::Wasm => Disassembler::Wasm(WasmDecoder),
        }
    }

    fn inner(&self) -> &dyn Decoder {
        match self {
            Disassembler::X86(d) | Disassembler::ArmV7(d) | Disassembler::ArmV8(d) => d,
            Disassembler::Wasm(d) => d,
        }
    }

    /// Random access: decode exactly one instruction at `offset`.
    pub fn decode_one(&self, code: &[u8], base: Address, offset: usize) -> Result<Instruction, DecodeError> {
        self.inner().decode(code, base, offset)
    }

    /// Decode one raw machine word of a fixed-width ISA located at `address`.
    pub fn decode_word(&self, word: u32, address: Address) -> Result<Instruction, DecodeError> {
        self.decode_one(&word.to_le_bytes(), address, 0)
    }

    /// Decode a whole contiguous region, stopping at the first fault.
    pub fn decode_all(&self, code: &[u8], base: Address) -> Result<Disassembly, DecodeError> {
        let instructions = self.iter(code, base).collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "decoded {} {} instructions from {} bytes at 0x{:x}",
            instructions.len(),
            self.architecture(),
            code.len(),
            base
        );

        Ok(Disassembly { base, instructions })
    }

    /// Lazy forward-only decoding over `code`.
    pub fn iter<'a>(&'a self, code: &'a [u8], base: Address) -> Instructions<'a> {
        Instructions {
            decoder: self,
            code,
            base,
            offset: 0,
            halted: false,
        }
    }
}

impl Decoder for Disassembler {
    fn architecture(&self) -> Architecture {
        self.inner().architecture()
    }

    fn decode(&self, code: &[u8], base: Address, offset: usize) -> Result<Instruction, DecodeError> {
        self.inner().decode(code, base, offset)
    }
}

impl fmt::Display for Disassembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Disassembler::{}", self.architecture())
    }
}

/// Lazily decoded instruction sequence.
///
/// Yields at most one error, after which the sequence is exhausted.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    decoder: &'a Disassembler,
    code: &'a [u8],
    base: Address,
    offset: usize,
    halted: bool,
}

impl Instructions<'_> {
    /// Rewind to the start of the span.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.halted = false;
    }

    /// Byte offset of the next instruction to decode.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted || self.offset >= self.code.len() {
            return None;
        }

        match self.decoder.decode_one(self.code, self.base, self.offset) {
            Ok(insn) if insn.size() > 0 => {
                self.offset += insn.size();
                Some(Ok(insn))
            }
            Ok(insn) => {
                self.halted = true;
                Some(Err(DecodeError::InvalidInstruction {
                    arch: insn.arch,
                    address: insn.ip,
                    offset: self.offset,
                    bytes: Vec::new(),
                }))
            }
            Err(e) => {
                self.halted = true;
                Some(Err(e))
            }
        }
    }
}
