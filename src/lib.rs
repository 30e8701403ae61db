//! Multi-architecture disassembly, ISIL lifting, control-flow graph
//! construction and stack-balance verification.
//!
//! Routines compiled for x86 (32/64-bit), ARMv7, ARMv8 or WebAssembly are
//! decoded into native instruction records, lifted into one
//! instruction-set-independent statement list (ISIL), partitioned into a
//! control-flow graph with synthetic Entry/Exit blocks, and checked for a
//! balanced stack along every path.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use isil_lift::{
//!     pipeline::{analyze_routine, AnalysisOptions, Routine},
//!     stack::StackTally,
//!     Architecture,
//! };
//!
//! // push rbp; pop rbp; ret
//! let code = [0x55, 0x5d, 0xc3];
//! let routine = Routine::new("tiny", 0x1000, &code);
//! let options = AnalysisOptions::new(Architecture::X86_64);
//!
//! let analysis = analyze_routine(&routine, &options).unwrap();
//! println!("{} blocks", analysis.cfg.block_count());
//!
//! let tally = StackTally::new();
//! tally.record(analysis.stack.is_ok());
//! assert_eq!(tally.balanced(), 1);
//! ```

pub mod reader;
pub mod decoder;
pub mod isil;
pub mod cfg;
pub mod stack;
pub mod pipeline;
pub mod loader;
pub mod format;
#[cfg(test)]
mod scenario_tests;

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;

/// Represents a virtual address in the analyzed binary
pub type Address = u64;

/// Supported source architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
pub enum Architecture {
    /// 32-bit x86
    #[value(name = "x86")]
    X86_32,
    /// 64-bit x86
    #[value(name = "x86-64", alias = "amd64")]
    X86_64,
    /// 32-bit ARM (ARM mode, fixed 4-byte encodings)
    #[value(name = "armv7", alias = "arm")]
    ArmV7,
    /// AArch64
    #[value(name = "armv8", alias = "aarch64")]
    ArmV8,
    /// WebAssembly function bodies
    #[value(name = "wasm")]
    Wasm,
}

impl Architecture {
    /// Size of one stack slot in bytes.
    pub fn pointer_width(&self) -> u64 {
        match self {
            Architecture::X86_64 | Architecture::ArmV8 => 8,
            Architecture::X86_32 | Architecture::ArmV7 | Architecture::Wasm => 4,
        }
    }

    /// Logical name of the stack pointer register, if the ISA has one.
    pub fn stack_pointer(&self) -> Option<&'static str> {
        match self {
            Architecture::X86_32 => Some("ESP"),
            Architecture::X86_64 => Some("RSP"),
            Architecture::ArmV7 | Architecture::ArmV8 => Some("SP"),
            Architecture::Wasm => None,
        }
    }

    /// Encoding width for fixed-width ISAs.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Architecture::ArmV7 | Architecture::ArmV8 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::ArmV7 => write!(f, "ARMv7"),
            Architecture::ArmV8 => write!(f, "ARMv8"),
            Architecture::Wasm => write!(f, "WebAssembly"),
        }
    }
}

/// A fault that aborts the analysis of a single routine.
///
/// Stack-discipline faults are not part of this type: they are reported on
/// the routine's analysis result and tallied instead.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Invalid or truncated encoding
    #[error(transparent)]
    Decode(#[from] decoder::DecodeError),

    /// No ISIL translation for a native instruction
    #[error(transparent)]
    Lift(#[from] isil::LiftError),

    /// Graph construction failed
    #[error(transparent)]
    Cfg(#[from] cfg::CfgError),
}
