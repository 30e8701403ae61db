//! Post-lift operand rewrites.
//!
//! A rewrite only ever sees one operand at a time and may hand back a
//! replacement for it. Statement count, opcodes and branch targets are out of
//! its reach: [`apply_rewrites`] skips branch-target positions entirely.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{IsilOperand, IsilStatement, IsilValue};
use crate::Address;

/// Read-only `address → literal` resolver shared across worker threads.
pub trait LiteralLookup: Send + Sync {
    fn literal_at(&self, address: Address) -> Option<String>;
}

impl<F> LiteralLookup for F
where
    F: Fn(Address) -> Option<String> + Send + Sync,
{
    fn literal_at(&self, address: Address) -> Option<String> {
        self(address)
    }
}

/// In-memory literal map.
#[derive(Debug, Clone, Default)]
pub struct LiteralTable {
    entries: HashMap<Address, String>,
}

impl LiteralTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, literal: impl Into<String>) {
        self.entries.insert(address, literal.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LiteralLookup for LiteralTable {
    fn literal_at(&self, address: Address) -> Option<String> {
        self.entries.get(&address).cloned()
    }
}

impl<S: Into<String>> FromIterator<(Address, S)> for LiteralTable {
    fn from_iter<I: IntoIterator<Item = (Address, S)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(a, s)| (a, s.into())).collect(),
        }
    }
}

/// An operand-level rewrite applied after lifting.
pub trait PostLiftRewrite: Send + Sync {
    fn name(&self) -> &str;

    /// Replacement for the operand at `position` of `statement`, if any.
    fn rewrite_operand(
        &self,
        statement: &IsilStatement,
        position: usize,
        operand: &IsilOperand,
    ) -> Option<IsilOperand>;
}

/// Resolves absolute memory operands (`[0x4010]`, no base or index) that a
/// statement reads into symbolic literals.
#[derive(Clone)]
pub struct LiteralRewrite {
    lookup: Arc<dyn LiteralLookup>,
}

impl LiteralRewrite {
    pub fn new(lookup: Arc<dyn LiteralLookup>) -> Self {
        Self { lookup }
    }
}

impl fmt::Debug for LiteralRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiteralRewrite").finish_non_exhaustive()
    }
}

impl PostLiftRewrite for LiteralRewrite {
    fn name(&self) -> &str {
        "literal"
    }

    fn rewrite_operand(&self, statement: &IsilStatement, position: usize, operand: &IsilOperand) -> Option<IsilOperand> {
        // loads only: a store destination or call target stays an address
        if !statement.opcode.reads_operand(position) {
            return None;
        }
        let IsilOperand::Memory(mem) = operand else {
            return None;
        };
        if mem.base.is_some() || mem.index.is_some() || mem.addend < 0 {
            return None;
        }
        self.lookup
            .literal_at(mem.addend as Address)
            .map(|literal| IsilOperand::Immediate(IsilValue::Literal(literal)))
    }
}

/// Run every rewrite over every operand, in order.
///
/// # Returns
/// The number of operands replaced
pub fn apply_rewrites(statements: &mut [IsilStatement], rewrites: &[&dyn PostLiftRewrite]) -> usize {
    let mut replaced = 0;

    for rewrite in rewrites {
        let mut count = 0;
        for stmt in statements.iter_mut() {
            for position in 0..stmt.operands.len() {
                let is_target = position == 0 && stmt.opcode.is_jump();
                if is_target || matches!(stmt.operands[position], IsilOperand::Statement(_)) {
                    continue;
                }
                if let Some(new) = rewrite.rewrite_operand(stmt, position, &stmt.operands[position]) {
                    if !matches!(new, IsilOperand::Statement(_)) {
                        stmt.operands[position] = new;
                        count += 1;
                    }
                }
            }
        }
        if count > 0 {
            log::debug!("rewrite `{}` replaced {} operand(s)", rewrite.name(), count);
        }
        replaced += count;
    }

    replaced
}
