//! Leader-based partitioning of a statement list into basic blocks.

use std::collections::BTreeSet;

use super::{Block, BlockId, BlockKind, CfgError, ControlFlowGraph, ENTRY, EXIT};
use crate::isil::{IsilOperand, IsilStatement, OpCode};

/// Resolved target of a jump statement, or a fault if it was never fixed up.
fn target_of(stmt: &IsilStatement, count: usize) -> Result<usize, CfgError> {
    let unresolved = |target: String| CfgError::UnresolvedTarget {
        statement: stmt.index,
        target,
    };
    match stmt.operands.first() {
        Some(IsilOperand::Statement(idx)) if *idx < count => Ok(*idx),
        Some(other) => Err(unresolved(other.to_string())),
        None => Err(unresolved("<none>".into())),
    }
}

/// Statement indices that start a block.
fn leaders(statements: &[IsilStatement]) -> Result<BTreeSet<usize>, CfgError> {
    let count = statements.len();
    let mut leaders = BTreeSet::new();
    if count == 0 {
        return Ok(leaders);
    }
    leaders.insert(0);

    for (n, stmt) in statements.iter().enumerate() {
        if stmt.opcode.is_jump() {
            leaders.insert(target_of(stmt, count)?);
        }
        if stmt.opcode.transfers_control() && n + 1 < count {
            leaders.insert(n + 1);
        }
    }
    Ok(leaders)
}

fn add_edge(blocks: &mut [Block], from: BlockId, to: BlockId) {
    if blocks[from].successors.contains(&to) {
        return;
    }
    blocks[from].successors.push(to);
    blocks[to].predecessors.push(from);
}

pub(super) fn build(statements: Vec<IsilStatement>) -> Result<ControlFlowGraph, CfgError> {
    let count = statements.len();
    let leaders: Vec<usize> = leaders(&statements)?.into_iter().collect();

    let mut blocks = vec![
        Block::new(ENTRY, BlockKind::Entry, 0..0),
        Block::new(EXIT, BlockKind::Exit, count..count),
    ];
    let mut block_of = vec![EXIT; count];

    for (n, &start) in leaders.iter().enumerate() {
        let end = leaders.get(n + 1).copied().unwrap_or(count);
        let kind = match statements[end - 1].opcode {
            OpCode::Call | OpCode::CallNoReturn => BlockKind::Call,
            _ => BlockKind::Normal,
        };
        let id = blocks.len();
        block_of[start..end].fill(id);
        blocks.push(Block::new(id, kind, start..end));
    }

    if blocks.len() > 2 {
        add_edge(&mut blocks, ENTRY, 2);
    }

    for id in 2..blocks.len() {
        let last = &statements[blocks[id].statements.end - 1];
        let fall_through = if id + 1 < blocks.len() { id + 1 } else { EXIT };

        let successors: Vec<BlockId> = match last.opcode {
            OpCode::Jump => vec![block_of[target_of(last, count)?]],
            op if op.is_conditional_jump() => vec![block_of[target_of(last, count)?], fall_through],
            OpCode::Call => vec![fall_through],
            OpCode::CallNoReturn | OpCode::Return | OpCode::Interrupt => vec![EXIT],
            _ => vec![fall_through],
        };
        for to in successors {
            add_edge(&mut blocks, id, to);
        }
    }

    Ok(ControlFlowGraph {
        statements,
        blocks,
        block_of,
    })
}
