//! Control-flow graphs over lifted ISIL statements.
//!
//! Blocks live in an arena owned by [`ControlFlowGraph`] and refer to each
//! other by [`BlockId`]. The synthetic Entry and Exit blocks always occupy
//! ids 0 and 1; body blocks follow in statement order.

mod builder;

use std::ops::Range;

use crate::isil::IsilStatement;

/// Index of a block inside its graph's arena
pub type BlockId = usize;

/// Id of the synthetic Entry block
pub const ENTRY: BlockId = 0;
/// Id of the synthetic Exit block
pub const EXIT: BlockId = 1;

/// Errors raised while building or validating a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    /// A branch operand that never went through jump fix-up, or points
    /// past the statement list
    #[error("statement {statement} branches to unresolved target {target}")]
    UnresolvedTarget { statement: usize, target: String },

    /// Edge lists that violate the graph invariants
    #[error("malformed graph at block {block}: {reason}")]
    Malformed { block: BlockId, reason: String },

    /// No path from Entry reaches Exit
    #[error("no path from entry reaches exit")]
    NoExit,
}

/// Role of a block in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Entry,
    Exit,
    Normal,
    /// Ends in `Call` or `CallNoReturn`
    Call,
}

/// A basic block: a contiguous run of statements with one entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Statement indices covered by the block; empty for Entry and Exit
    pub statements: Range<usize>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

impl Block {
    fn new(id: BlockId, kind: BlockKind, statements: Range<usize>) -> Self {
        Self {
            id,
            kind,
            statements,
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// A call block whose only successor is Exit.
    pub fn is_tail_call(&self) -> bool {
        self.kind == BlockKind::Call && self.successors == [EXIT]
    }
}

/// Control-flow graph of one routine. Read-only once built.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    statements: Vec<IsilStatement>,
    blocks: Vec<Block>,
    /// Statement index → owning block
    block_of: Vec<BlockId>,
}

impl ControlFlowGraph {
    /// Partition `statements` into blocks, wire the edges and validate.
    pub fn build(statements: Vec<IsilStatement>) -> Result<Self, CfgError> {
        let cfg = builder::build(statements)?;
        cfg.validate()?;

        log::debug!(
            "built cfg with {} blocks over {} statements",
            cfg.block_count(),
            cfg.statements.len()
        );
        Ok(cfg)
    }

    pub fn entry(&self) -> &Block {
        &self.blocks[ENTRY]
    }

    pub fn exit(&self) -> &Block {
        &self.blocks[EXIT]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Number of blocks, Entry and Exit included.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn statements(&self) -> &[IsilStatement] {
        &self.statements
    }

    /// Statements of one block.
    pub fn block_statements(&self, id: BlockId) -> &[IsilStatement] {
        self.blocks
            .get(id)
            .map(|b| &self.statements[b.statements.clone()])
            .unwrap_or(&[])
    }

    /// Block owning the statement at `index`.
    pub fn block_of_statement(&self, index: usize) -> Option<BlockId> {
        self.block_of.get(index).copied()
    }

    /// Every edge as `(from, to)`.
    pub fn edges(&self) -> impl Iterator<Item = (BlockId, BlockId)> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| b.successors.iter().map(move |&s| (b.id, s)))
    }

    /// Blocks reachable from Entry, by id.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut work = vec![ENTRY];
        while let Some(id) = work.pop() {
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            work.extend(self.blocks[id].successors.iter().copied().filter(|&s| !seen[s]));
        }
        seen
    }

    /// Check the structural invariants of the graph.
    pub fn validate(&self) -> Result<(), CfgError> {
        let malformed = |block: BlockId, reason: &str| CfgError::Malformed {
            block,
            reason: reason.to_string(),
        };
        let empty_body = self.statements.is_empty();

        // every edge is recorded on both endpoints
        for (from, to) in self.edges() {
            let target = self.blocks.get(to).ok_or_else(|| malformed(from, "successor out of range"))?;
            if !target.predecessors.contains(&from) {
                return Err(malformed(to, "successor does not list the predecessor"));
            }
        }
        for block in &self.blocks {
            for &pred in &block.predecessors {
                let source = self.blocks.get(pred).ok_or_else(|| malformed(block.id, "predecessor out of range"))?;
                if !source.successors.contains(&block.id) {
                    return Err(malformed(block.id, "predecessor does not list the successor"));
                }
            }
        }

        let entry = self.entry();
        if !entry.predecessors.is_empty() {
            return Err(malformed(ENTRY, "entry has predecessors"));
        }
        if entry.successors.is_empty() && !empty_body {
            return Err(malformed(ENTRY, "entry has no successor"));
        }

        let exit = self.exit();
        if !exit.successors.is_empty() {
            return Err(malformed(EXIT, "exit has successors"));
        }

        if empty_body {
            return Ok(());
        }

        let reachable = self.reachable();
        if !reachable[EXIT] {
            return Err(CfgError::NoExit);
        }

        for block in self.blocks.iter().skip(2).filter(|b| reachable[b.id]) {
            if block.predecessors.is_empty() {
                return Err(malformed(block.id, "reachable block without predecessor"));
            }
            if block.successors.is_empty() {
                return Err(malformed(block.id, "reachable block without successor"));
            }
        }

        // statements are covered exactly once
        let covered: usize = self.blocks.iter().map(Block::len).sum();
        if covered != self.statements.len() {
            return Err(malformed(ENTRY, "blocks do not partition the statement list"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isil::{IsilOperand, OpCode};

    fn stmt(index: usize, opcode: OpCode, operands: Vec<IsilOperand>) -> IsilStatement {
        IsilStatement {
            index,
            address: index as u64 * 4,
            opcode,
            operands,
        }
    }

    fn assert_well_formed(cfg: &ControlFlowGraph) {
        cfg.validate().unwrap();
        for (n, _) in cfg.statements().iter().enumerate() {
            let owner = cfg.block_of_statement(n).unwrap();
            assert!(cfg.blocks()[owner].statements.contains(&n));
        }
    }

    #[test]
    fn test_straight_line_routine() {
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Push, vec![IsilOperand::reg("RBP")]),
            stmt(1, OpCode::Pop, vec![IsilOperand::reg("RBP")]),
            stmt(2, OpCode::Return, vec![]),
        ])
        .unwrap();

        assert_well_formed(&cfg);
        assert_eq!(cfg.block_count(), 3);
        assert_eq!(cfg.entry().successors, vec![2]);
        assert_eq!(cfg.blocks()[2].statements, 0..3);
        assert_eq!(cfg.blocks()[2].successors, vec![EXIT]);
        assert_eq!(cfg.exit().predecessors, vec![2]);
    }

    #[test]
    fn test_conditional_branch_splits_blocks() {
        // 0: cmp; 1: je @3; 2: inc; 3: ret
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Compare, vec![IsilOperand::reg("EAX"), IsilOperand::int(0)]),
            stmt(1, OpCode::JumpIfEqual, vec![IsilOperand::Statement(3)]),
            stmt(2, OpCode::Add, vec![IsilOperand::reg("EAX"), IsilOperand::reg("EAX"), IsilOperand::int(1)]),
            stmt(3, OpCode::Return, vec![]),
        ])
        .unwrap();

        assert_well_formed(&cfg);
        // entry, exit, [0..2], [2..3], [3..4]
        assert_eq!(cfg.block_count(), 5);
        let head = &cfg.blocks()[2];
        assert_eq!(head.successors.len(), 2);
        assert!(head.successors.contains(&3) && head.successors.contains(&4));
        assert_eq!(cfg.blocks()[4].predecessors.len(), 2);
    }

    #[test]
    fn test_branch_to_next_statement_is_deduplicated() {
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::JumpIfEqual, vec![IsilOperand::Statement(1)]),
            stmt(1, OpCode::Return, vec![]),
        ])
        .unwrap();
        assert_eq!(cfg.blocks()[2].successors, vec![3]);
        assert_eq!(cfg.blocks()[3].predecessors, vec![2]);
    }

    #[test]
    fn test_call_kinds() {
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Call, vec![IsilOperand::address(0x5000)]),
            stmt(1, OpCode::CallNoReturn, vec![IsilOperand::address(0x6000)]),
        ])
        .unwrap();

        assert_well_formed(&cfg);
        let call = &cfg.blocks()[2];
        let tail = &cfg.blocks()[3];
        assert_eq!(call.kind, BlockKind::Call);
        assert_eq!(call.successors, vec![3]);
        assert!(!call.is_tail_call());
        assert_eq!(tail.kind, BlockKind::Call);
        assert!(tail.is_tail_call());
    }

    #[test]
    fn test_fall_through_past_end_reaches_exit() {
        let cfg = ControlFlowGraph::build(vec![stmt(0, OpCode::Move, vec![])]).unwrap();
        assert_eq!(cfg.blocks()[2].successors, vec![EXIT]);
    }

    #[test]
    fn test_interrupt_ends_block() {
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Interrupt, vec![]),
            stmt(1, OpCode::Return, vec![]),
        ])
        .unwrap();
        assert_eq!(cfg.blocks()[2].successors, vec![EXIT]);
        // unreachable trailing block is still well formed
        assert_eq!(cfg.blocks()[3].successors, vec![EXIT]);
        assert!(cfg.blocks()[3].predecessors.is_empty());
        assert!(!cfg.reachable()[3]);
    }

    #[test]
    fn test_empty_body() {
        let cfg = ControlFlowGraph::build(Vec::new()).unwrap();
        assert_eq!(cfg.block_count(), 2);
        assert!(cfg.entry().successors.is_empty());
        assert!(cfg.exit().predecessors.is_empty());
    }

    #[test]
    fn test_infinite_loop_has_no_exit() {
        let err = ControlFlowGraph::build(vec![stmt(0, OpCode::Jump, vec![IsilOperand::Statement(0)])]).unwrap_err();
        assert_eq!(err, CfgError::NoExit);
    }

    #[test]
    fn test_unresolved_branch_operand() {
        let err = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Jump, vec![IsilOperand::address(0x40)]),
            stmt(1, OpCode::Return, vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, CfgError::UnresolvedTarget { statement: 0, .. }));

        let err = ControlFlowGraph::build(vec![stmt(0, OpCode::Jump, vec![IsilOperand::Statement(7)])]).unwrap_err();
        assert!(matches!(err, CfgError::UnresolvedTarget { statement: 0, .. }));
    }

    #[test]
    fn test_loop_back_edge() {
        // 0: mov; 1: cmp; 2: jne @1; 3: ret
        let cfg = ControlFlowGraph::build(vec![
            stmt(0, OpCode::Move, vec![]),
            stmt(1, OpCode::Compare, vec![]),
            stmt(2, OpCode::JumpIfNotEqual, vec![IsilOperand::Statement(1)]),
            stmt(3, OpCode::Return, vec![]),
        ])
        .unwrap();
        assert_well_formed(&cfg);
        let body = cfg.block_of_statement(1).unwrap();
        assert!(cfg.blocks()[body].predecessors.contains(&body));
        assert_eq!(cfg.edges().count(), 5);
    }
}
