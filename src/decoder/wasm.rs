//! Table-driven WebAssembly function-body decoder.
//!
//! Every opcode maps to exactly one operand shape, so decoding is a byte
//! lookup followed by a shape-specific read. Unknown opcodes are faults.

use super::{DecodeError, Immediate, Indexing, Instruction, Mnemonic, Operand};
use crate::reader::{ByteReader, ReadError};
use crate::{Address, Architecture};

/// Prefix byte of the saturating-truncation / bulk-memory group.
const MISC_PREFIX: u8 = 0xfc;

/// Operand encoding that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    /// One raw byte (reserved memory index)
    Byte,
    /// Two raw bytes (`memory.copy` memory indices)
    TwoBytes,
    /// One unsigned LEB128
    Uleb,
    /// Two unsigned LEB128s (memarg, `call_indirect`)
    TwoUleb,
    /// Signed LEB128 constrained to 32 bits
    Sleb32,
    /// Signed LEB128 constrained to 64 bits
    Sleb64,
    F32,
    F64,
    /// Label vector followed by the default label
    BrTable,
    /// Signed 33-bit LEB128: empty (`0x40`), one value type, or a type index
    BlockType,
    /// Vector of value-type bytes (typed `select`)
    ValueTypes,
}

/// Semantic grouping used by the lifter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Control,
    Parametric,
    Variable,
    Load,
    Store,
    Memory,
    Const,
    /// `eqz`: one operand, produces a comparison result
    Test,
    Compare,
    Unary,
    Binary,
    Convert,
}

macro_rules! wasm_opcodes {
    (
        plain { $($code:literal => $variant:ident, $name:literal, $shape:ident, $class:ident;)* }
        misc { $($sub:literal => $mvariant:ident, $mname:literal, $mshape:ident, $mclass:ident;)* }
    ) => {
        /// WebAssembly opcodes understood by the decoder.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum WasmOpcode {
            $($variant,)*
            $($mvariant,)*
        }

        impl WasmOpcode {
            /// Look up a single-byte opcode.
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($code => Some(WasmOpcode::$variant),)*
                    _ => None,
                }
            }

            /// Look up a `0xFC`-prefixed opcode by its sub-opcode.
            pub fn from_misc(sub: u64) -> Option<Self> {
                match sub {
                    $($sub => Some(WasmOpcode::$mvariant),)*
                    _ => None,
                }
            }

            /// Text-format name (`i32.const`).
            pub fn name(&self) -> &'static str {
                match self {
                    $(WasmOpcode::$variant => $name,)*
                    $(WasmOpcode::$mvariant => $mname,)*
                }
            }

            pub fn shape(&self) -> OperandShape {
                match self {
                    $(WasmOpcode::$variant => OperandShape::$shape,)*
                    $(WasmOpcode::$mvariant => OperandShape::$mshape,)*
                }
            }

            pub fn class(&self) -> OpClass {
                match self {
                    $(WasmOpcode::$variant => OpClass::$class,)*
                    $(WasmOpcode::$mvariant => OpClass::$mclass,)*
                }
            }
        }
    };
}

wasm_opcodes! {
    plain {
        0x00 => Unreachable, "unreachable", None, Control;
        0x01 => Nop, "nop", None, Control;
        0x02 => Block, "block", BlockType, Control;
        0x03 => Loop, "loop", BlockType, Control;
        0x04 => If, "if", BlockType, Control;
        0x05 => Else, "else", None, Control;
        0x0b => End, "end", None, Control;
        0x0c => Br, "br", Uleb, Control;
        0x0d => BrIf, "br_if", Uleb, Control;
        0x0e => BrTable, "br_table", BrTable, Control;
        0x0f => Return, "return", None, Control;
        0x10 => Call, "call", Uleb, Control;
        0x11 => CallIndirect, "call_indirect", TwoUleb, Control;
        0x1a => Drop, "drop", None, Parametric;
        0x1b => Select, "select", None, Parametric;
        0x1c => SelectTyped, "select", ValueTypes, Parametric;
        0x20 => LocalGet, "local.get", Uleb, Variable;
        0x21 => LocalSet, "local.set", Uleb, Variable;
        0x22 => LocalTee, "local.tee", Uleb, Variable;
        0x23 => GlobalGet, "global.get", Uleb, Variable;
        0x24 => GlobalSet, "global.set", Uleb, Variable;
        0x28 => I32Load, "i32.load", TwoUleb, Load;
        0x29 => I64Load, "i64.load", TwoUleb, Load;
        0x2a => F32Load, "f32.load", TwoUleb, Load;
        0x2b => F64Load, "f64.load", TwoUleb, Load;
        0x2c => I32Load8S, "i32.load8_s", TwoUleb, Load;
        0x2d => I32Load8U, "i32.load8_u", TwoUleb, Load;
        0x2e => I32Load16S, "i32.load16_s", TwoUleb, Load;
        0x2f => I32Load16U, "i32.load16_u", TwoUleb, Load;
        0x30 => I64Load8S, "i64.load8_s", TwoUleb, Load;
        0x31 => I64Load8U, "i64.load8_u", TwoUleb, Load;
        0x32 => I64Load16S, "i64.load16_s", TwoUleb, Load;
        0x33 => I64Load16U, "i64.load16_u", TwoUleb, Load;
        0x34 => I64Load32S, "i64.load32_s", TwoUleb, Load;
        0x35 => I64Load32U, "i64.load32_u", TwoUleb, Load;
        0x36 => I32Store, "i32.store", TwoUleb, Store;
        0x37 => I64Store, "i64.store", TwoUleb, Store;
        0x38 => F32Store, "f32.store", TwoUleb, Store;
        0x39 => F64Store, "f64.store", TwoUleb, Store;
        0x3a => I32Store8, "i32.store8", TwoUleb, Store;
        0x3b => I32Store16, "i32.store16", TwoUleb, Store;
        0x3c => I64Store8, "i64.store8", TwoUleb, Store;
        0x3d => I64Store16, "i64.store16", TwoUleb, Store;
        0x3e => I64Store32, "i64.store32", TwoUleb, Store;
        0x3f => MemorySize, "memory.size", Byte, Memory;
        0x40 => MemoryGrow, "memory.grow", Byte, Memory;
        0x41 => I32Const, "i32.const", Sleb32, Const;
        0x42 => I64Const, "i64.const", Sleb64, Const;
        0x43 => F32Const, "f32.const", F32, Const;
        0x44 => F64Const, "f64.const", F64, Const;
        0x45 => I32Eqz, "i32.eqz", None, Test;
        0x46 => I32Eq, "i32.eq", None, Compare;
        0x47 => I32Ne, "i32.ne", None, Compare;
        0x48 => I32LtS, "i32.lt_s", None, Compare;
        0x49 => I32LtU, "i32.lt_u", None, Compare;
        0x4a => I32GtS, "i32.gt_s", None, Compare;
        0x4b => I32GtU, "i32.gt_u", None, Compare;
        0x4c => I32LeS, "i32.le_s", None, Compare;
        0x4d => I32LeU, "i32.le_u", None, Compare;
        0x4e => I32GeS, "i32.ge_s", None, Compare;
        0x4f => I32GeU, "i32.ge_u", None, Compare;
        0x50 => I64Eqz, "i64.eqz", None, Test;
        0x51 => I64Eq, "i64.eq", None, Compare;
        0x52 => I64Ne, "i64.ne", None, Compare;
        0x53 => I64LtS, "i64.lt_s", None, Compare;
        0x54 => I64LtU, "i64.lt_u", None, Compare;
        0x55 => I64GtS, "i64.gt_s", None, Compare;
        0x56 => I64GtU, "i64.gt_u", None, Compare;
        0x57 => I64LeS, "i64.le_s", None, Compare;
        0x58 => I64LeU, "i64.le_u", None, Compare;
        0x59 => I64GeS, "i64.ge_s", None, Compare;
        0x5a => I64GeU, "i64.ge_u", None, Compare;
        0x5b => F32Eq, "f32.eq", None, Compare;
        0x5c => F32Ne, "f32.ne", None, Compare;
        0x5d => F32Lt, "f32.lt", None, Compare;
        0x5e => F32Gt, "f32.gt", None, Compare;
        0x5f => F32Le, "f32.le", None, Compare;
        0x60 => F32Ge, "f32.ge", None, Compare;
        0x61 => F64Eq, "f64.eq", None, Compare;
        0x62 => F64Ne, "f64.ne", None, Compare;
        0x63 => F64Lt, "f64.lt", None, Compare;
        0x64 => F64Gt, "f64.gt", None, Compare;
        0x65 => F64Le, "f64.le", None, Compare;
        0x66 => F64Ge, "f64.ge", None, Compare;
        0x67 => I32Clz, "i32.clz", None, Unary;
        0x68 => I32Ctz, "i32.ctz", None, Unary;
        0x69 => I32Popcnt, "i32.popcnt", None, Unary;
        0x6a => I32Add, "i32.add", None, Binary;
        0x6b => I32Sub, "i32.sub", None, Binary;
        0x6c => I32Mul, "i32.mul", None, Binary;
        0x6d => I32DivS, "i32.div_s", None, Binary;
        0x6e => I32DivU, "i32.div_u", None, Binary;
        0x6f => I32RemS, "i32.rem_s", None, Binary;
        0x70 => I32RemU, "i32.rem_u", None, Binary;
        0x71 => I32And, "i32.and", None, Binary;
        0x72 => I32Or, "i32.or", None, Binary;
        0x73 => I32Xor, "i32.xor", None, Binary;
        0x74 => I32Shl, "i32.shl", None, Binary;
        0x75 => I32ShrS, "i32.shr_s", None, Binary;
        0x76 => I32ShrU, "i32.shr_u", None, Binary;
        0x77 => I32Rotl, "i32.rotl", None, Binary;
        0x78 => I32Rotr, "i32.rotr", None, Binary;
        0x79 => I64Clz, "i64.clz", None, Unary;
        0x7a => I64Ctz, "i64.ctz", None, Unary;
        0x7b => I64Popcnt, "i64.popcnt", None, Unary;
        0x7c => I64Add, "i64.add", None, Binary;
        0x7d => I64Sub, "i64.sub", None, Binary;
        0x7e => I64Mul, "i64.mul", None, Binary;
        0x7f => I64DivS, "i64.div_s", None, Binary;
        0x80 => I64DivU, "i64.div_u", None, Binary;
        0x81 => I64RemS, "i64.rem_s", None, Binary;
        0x82 => I64RemU, "i64.rem_u", None, Binary;
        0x83 => I64And, "i64.and", None, Binary;
        0x84 => I64Or, "i64.or", None, Binary;
        0x85 => I64Xor, "i64.xor", None, Binary;
        0x86 => I64Shl, "i64.shl", None, Binary;
        0x87 => I64ShrS, "i64.shr_s", None, Binary;
        0x88 => I64ShrU, "i64.shr_u", None, Binary;
        0x89 => I64Rotl, "i64.rotl", None, Binary;
        0x8a => I64Rotr, "i64.rotr", None, Binary;
        0x8b => F32Abs, "f32.abs", None, Unary;
        0x8c => F32Neg, "f32.neg", None, Unary;
        0x8d => F32Ceil, "f32.ceil", None, Unary;
        0x8e => F32Floor, "f32.floor", None, Unary;
        0x8f => F32Trunc, "f32.trunc", None, Unary;
        0x90 => F32Nearest, "f32.nearest", None, Unary;
        0x91 => F32Sqrt, "f32.sqrt", None, Unary;
        0x92 => F32Add, "f32.add", None, Binary;
        0x93 => F32Sub, "f32.sub", None, Binary;
        0x94 => F32Mul, "f32.mul", None, Binary;
        0x95 => F32Div, "f32.div", None, Binary;
        0x96 => F32Min, "f32.min", None, Binary;
        0x97 => F32Max, "f32.max", None, Binary;
        0x98 => F32Copysign, "f32.copysign", None, Binary;
        0x99 => F64Abs, "f64.abs", None, Unary;
        0x9a => F64Neg, "f64.neg", None, Unary;
        0x9b => F64Ceil, "f64.ceil", None, Unary;
        0x9c => F64Floor, "f64.floor", None, Unary;
        0x9d => F64Trunc, "f64.trunc", None, Unary;
        0x9e => F64Nearest, "f64.nearest", None, Unary;
        0x9f => F64Sqrt, "f64.sqrt", None, Unary;
        0xa0 => F64Add, "f64.add", None, Binary;
        0xa1 => F64Sub, "f64.sub", None, Binary;
        0xa2 => F64Mul, "f64.mul", None, Binary;
        0xa3 => F64Div, "f64.div", None, Binary;
        0xa4 => F64Min, "f64.min", None, Binary;
        0xa5 => F64Max, "f64.max", None, Binary;
        0xa6 => F64Copysign, "f64.copysign", None, Binary;
        0xa7 => I32WrapI64, "i32.wrap_i64", None, Convert;
        0xa8 => I32TruncF32S, "i32.trunc_f32_s", None, Convert;
        0xa9 => I32TruncF32U, "i32.trunc_f32_u", None, Convert;
        0xaa => I32TruncF64S, "i32.trunc_f64_s", None, Convert;
        0xab => I32TruncF64U, "i32.trunc_f64_u", None, Convert;
        0xac => I64ExtendI32S, "i64.extend_i32_s", None, Convert;
        0xad => I64ExtendI32U, "i64.extend_i32_u", None, Convert;
        0xae => I64TruncF32S, "i64.trunc_f32_s", None, Convert;
        0xaf => I64TruncF32U, "i64.trunc_f32_u", None, Convert;
        0xb0 => I64TruncF64S, "i64.trunc_f64_s", None, Convert;
        0xb1 => I64TruncF64U, "i64.trunc_f64_u", None, Convert;
        0xb2 => F32ConvertI32S, "f32.convert_i32_s", None, Convert;
        0xb3 => F32ConvertI32U, "f32.convert_i32_u", None, Convert;
        0xb4 => F32ConvertI64S, "f32.convert_i64_s", None, Convert;
        0xb5 => F32ConvertI64U, "f32.convert_i64_u", None, Convert;
        0xb6 => F32DemoteF64, "f32.demote_f64", None, Convert;
        0xb7 => F64ConvertI32S, "f64.convert_i32_s", None, Convert;
        0xb8 => F64ConvertI32U, "f64.convert_i32_u", None, Convert;
        0xb9 => F64ConvertI64S, "f64.convert_i64_s", None, Convert;
        0xba => F64ConvertI64U, "f64.convert_i64_u", None, Convert;
        0xbb => F64PromoteF32, "f64.promote_f32", None, Convert;
        0xbc => I32ReinterpretF32, "i32.reinterpret_f32", None, Convert;
        0xbd => I64ReinterpretF64, "i64.reinterpret_f64", None, Convert;
        0xbe => F32ReinterpretI32, "f32.reinterpret_i32", None, Convert;
        0xbf => F64ReinterpretI64, "f64.reinterpret_i64", None, Convert;
        0xc0 => I32Extend8S, "i32.extend8_s", None, Convert;
        0xc1 => I32Extend16S, "i32.extend16_s", None, Convert;
        0xc2 => I64Extend8S, "i64.extend8_s", None, Convert;
        0xc3 => I64Extend16S, "i64.extend16_s", None, Convert;
        0xc4 => I64Extend32S, "i64.extend32_s", None, Convert;
    }
    misc {
        0 => I32TruncSatF32S, "i32.trunc_sat_f32_s", None, Convert;
        1 => I32TruncSatF32U, "i32.trunc_sat_f32_u", None, Convert;
        2 => I32TruncSatF64S, "i32.trunc_sat_f64_s", None, Convert;
        3 => I32TruncSatF64U, "i32.trunc_sat_f64_u", None, Convert;
        4 => I64TruncSatF32S, "i64.trunc_sat_f32_s", None, Convert;
        5 => I64TruncSatF32U, "i64.trunc_sat_f32_u", None, Convert;
        6 => I64TruncSatF64S, "i64.trunc_sat_f64_s", None, Convert;
        7 => I64TruncSatF64U, "i64.trunc_sat_f64_u", None, Convert;
        10 => MemoryCopy, "memory.copy", TwoBytes, Memory;
        11 => MemoryFill, "memory.fill", Byte, Memory;
    }
}

/// Decoder for WebAssembly code bodies (the instruction stream after the
/// local declarations).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WasmDecoder;

impl WasmDecoder {
    fn read_operands(
        &self,
        opcode: WasmOpcode,
        reader: &mut ByteReader<'_>,
    ) -> Result<Vec<Operand>, ReadError> {
        let unsigned = |v: u64| Operand::Immediate(Immediate::Unsigned(v));

        let operands = match opcode.shape() {
            OperandShape::None => Vec::new(),
            OperandShape::Byte => vec![unsigned(u64::from(reader.read_u8()?))],
            OperandShape::TwoBytes => vec![
                unsigned(u64::from(reader.read_u8()?)),
                unsigned(u64::from(reader.read_u8()?)),
            ],
            OperandShape::Uleb => vec![unsigned(reader.read_uleb128()?)],
            OperandShape::TwoUleb => vec![unsigned(reader.read_uleb128()?), unsigned(reader.read_uleb128()?)],
            OperandShape::Sleb32 => {
                let start = reader.position();
                let value = reader.read_sleb128()?;
                if i32::try_from(value).is_err() {
                    return Err(ReadError::VarintOverflow { offset: start });
                }
                vec![Operand::Immediate(Immediate::Signed(value))]
            }
            OperandShape::Sleb64 => vec![Operand::Immediate(Immediate::Signed(reader.read_sleb128()?))],
            OperandShape::F32 => vec![Operand::Immediate(Immediate::F32(reader.read_f32()?))],
            OperandShape::F64 => vec![Operand::Immediate(Immediate::F64(reader.read_f64()?))],
            OperandShape::BrTable => {
                let count = reader.read_uleb128()?;
                let mut labels = Vec::new();
                // count labels plus the default
                for _ in 0..=count {
                    labels.push(unsigned(reader.read_uleb128()?));
                }
                labels
            }
            OperandShape::BlockType => {
                let start = reader.position();
                let value = reader.read_sleb128()?;
                if !(-(1i64 << 32)..(1i64 << 32)).contains(&value) {
                    return Err(ReadError::VarintOverflow { offset: start });
                }
                vec![Operand::Immediate(Immediate::Signed(value))]
            }
            OperandShape::ValueTypes => {
                let count = reader.read_uleb128()?;
                let mut types = Vec::new();
                for _ in 0..count {
                    types.push(unsigned(u64::from(reader.read_u8()?)));
                }
                types
            }
        };

        Ok(operands)
    }
}

impl super::Decoder for WasmDecoder {
    fn architecture(&self) -> Architecture {
        Architecture::Wasm
    }

    fn decode(&self, code: &[u8], base: Address, offset: usize) -> Result<Instruction, DecodeError> {
        let address = base + offset as Address;
        let mut reader = ByteReader::at(code, offset);

        let byte = reader.read_u8().map_err(|_| DecodeError::Truncated {
            arch: Architecture::Wasm,
            address,
            offset,
            needed: 1,
            available: 0,
        })?;

        let opcode = if byte == MISC_PREFIX {
            let sub = reader.read_uleb128().map_err(|source| DecodeError::MalformedOperand {
                mnemonic: format!("0x{:02x} prefix", MISC_PREFIX),
                address,
                offset,
                source,
            })?;
            WasmOpcode::from_misc(sub).ok_or(DecodeError::UnknownOpcode {
                arch: Architecture::Wasm,
                opcode: (u32::from(MISC_PREFIX) << 8) | (sub.min(0xff) as u32),
                address,
                offset,
            })?
        } else {
            WasmOpcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode {
                arch: Architecture::Wasm,
                opcode: u32::from(byte),
                address,
                offset,
            })?
        };

        let operands = self
            .read_operands(opcode, &mut reader)
            .map_err(|source| DecodeError::MalformedOperand {
                mnemonic: opcode.name().to_string(),
                address,
                offset,
                source,
            })?;

        let bytes = reader.consumed_since(offset).to_vec();
        let text = operands.iter().map(render).collect::<Vec<_>>().join(" ");

        Ok(Instruction {
            arch: Architecture::Wasm,
            ip: address,
            next_ip: address + bytes.len() as Address,
            mnemonic: Mnemonic::Wasm(opcode),
            operands,
            bytes,
            text,
            indexing: Indexing::Offset,
        })
    }
}

fn render(operand: &Operand) -> String {
    match operand {
        Operand::Immediate(Immediate::Signed(v)) => v.to_string(),
        Operand::Immediate(Immediate::Unsigned(v)) => v.to_string(),
        Operand::Immediate(Immediate::F32(v)) => v.to_string(),
        Operand::Immediate(Immediate::F64(v)) => v.to_string(),
        other => format!("{:?}", other),
    }
}
