//! Abstract stack simulation over a control-flow graph.
//!
//! The analyzer walks the graph from Entry with an explicit work list,
//! replaying `Push`, `Pop` and `ShiftStack` on an abstract stack. Every path
//! into a block must agree on the incoming state, and Exit must be reached
//! with an empty stack. A call block that leads straight to Exit is a tail
//! call and resets the state. A `ShiftStack` lifted from the same native
//! instruction as the `Return` after it (`ret imm16`) releases the caller's
//! arguments, which lie above the routine's entry depth.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::ValueEnum;

use crate::cfg::{BlockId, ControlFlowGraph, ENTRY, EXIT};
use crate::isil::{IsilOperand, IsilStatement, OpCode};
use crate::Architecture;

/// Stack-discipline faults
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    /// `ShiftStack` by an amount that is not a whole number of slots
    #[error("statement {statement}: stack shift {shift} is not a multiple of the {width}-byte slot width")]
    Misaligned { statement: usize, shift: i64, width: u64 },

    /// `Pop` on an empty stack
    #[error("statement {statement}: pop from an empty stack")]
    PopFromEmpty { statement: usize },

    /// `ShiftStack` releasing more slots than are allocated
    #[error("statement {statement}: releasing {requested} slot(s) with only {depth} on the stack")]
    Underflow {
        statement: usize,
        requested: usize,
        depth: usize,
    },

    /// `ShiftStack` without an integer amount
    #[error("statement {statement}: stack shift without an integer amount")]
    MalformedShift { statement: usize },

    /// Two paths reach a block with different stack states
    #[error("block {block}: incoming stack depth {found} differs from the recorded {expected}")]
    MergeMismatch {
        block: BlockId,
        expected: usize,
        found: usize,
    },

    /// Exit reached with values left on the stack
    #[error("exit reached with {depth} slot(s) still on the stack")]
    NonEmptyExit { depth: usize },
}

/// Stack granularity of the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StackMode {
    /// Track only the slot count
    #[default]
    Depth,
    /// Track every slot with its provenance, and record a per-statement trace
    Slots,
}

impl fmt::Display for StackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackMode::Depth => write!(f, "depth"),
            StackMode::Slots => write!(f, "slots"),
        }
    }
}

/// What put a slot on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// An explicit `Push`
    Value,
    /// Space allocated by a negative `ShiftStack`
    Reserved,
}

/// One abstract stack slot.
///
/// Equality only looks at the kind: two paths pushing a value from different
/// statements still agree on the stack shape.
#[derive(Debug, Clone, Copy)]
pub struct StackSlot {
    pub kind: SlotKind,
    /// Statement that created the slot
    pub origin: usize,
}

impl PartialEq for StackSlot {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for StackSlot {}

/// Abstract stack at a block boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    Depth(usize),
    Slots(Vec<StackSlot>),
}

impl StackState {
    /// The canonical empty state for `mode`.
    pub fn empty(mode: StackMode) -> Self {
        match mode {
            StackMode::Depth => StackState::Depth(0),
            StackMode::Slots => StackState::Slots(Vec::new()),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            StackState::Depth(depth) => *depth,
            StackState::Slots(slots) => slots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    fn push(&mut self, slot: StackSlot) {
        match self {
            StackState::Depth(depth) => *depth += 1,
            StackState::Slots(slots) => slots.push(slot),
        }
    }

    /// Remove `count` slots; false if there are not enough.
    fn release(&mut self, count: usize) -> bool {
        if self.depth() < count {
            return false;
        }
        match self {
            StackState::Depth(depth) => *depth -= count,
            StackState::Slots(slots) => slots.truncate(slots.len() - count),
        }
        true
    }

    fn clear(&mut self) {
        match self {
            StackState::Depth(depth) => *depth = 0,
            StackState::Slots(slots) => slots.clear(),
        }
    }
}

/// Depth before every statement, recorded in slots mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    width: u64,
    /// `None` for statements in unreachable blocks
    depths: Vec<Option<usize>>,
}

impl StackTrace {
    pub fn depth_before(&self, statement: usize) -> Option<usize> {
        self.depths.get(statement).copied().flatten()
    }

    /// Translate `[sp + addend]` at `statement` into an offset relative to
    /// the stack pointer at routine entry.
    pub fn frame_offset(&self, statement: usize, addend: i64) -> Option<i64> {
        let depth = self.depth_before(statement)? as i64;
        Some(addend - depth * self.width as i64)
    }

    /// Replace every `[sp + addend]` operand (no index register) with a
    /// `StackOffset`.
    ///
    /// # Returns
    /// The number of operands rewritten
    pub fn rewrite_stack_operands(&self, statements: &mut [IsilStatement], stack_pointer: &str) -> usize {
        let mut rewritten = 0;
        for (n, stmt) in statements.iter_mut().enumerate() {
            for operand in stmt.operands.iter_mut() {
                let IsilOperand::Memory(mem) = operand else {
                    continue;
                };
                if mem.base.as_deref() != Some(stack_pointer) || mem.index.is_some() {
                    continue;
                }
                if let Some(offset) = self.frame_offset(n, mem.addend) {
                    *operand = IsilOperand::StackOffset(offset);
                    rewritten += 1;
                }
            }
        }
        rewritten
    }
}

/// Result of a balanced routine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub mode: StackMode,
    /// Deepest point reached on any path, in slots
    pub max_depth: usize,
    /// Call blocks that reset the state on their way to Exit
    pub tail_calls: usize,
    /// Blocks reached from Entry
    pub visited_blocks: usize,
    /// Caller-pushed argument slots released on return, 0 when the caller
    /// cleans up
    pub argument_slots: usize,
    /// Per-statement depths; slots mode only
    pub trace: Option<StackTrace>,
}

/// Stack-balance verifier for one architecture.
#[derive(Debug, Clone, Copy)]
pub struct StackAnalyzer {
    width: u64,
    mode: StackMode,
}

impl StackAnalyzer {
    pub fn new(arch: Architecture, mode: StackMode) -> Self {
        Self {
            width: arch.pointer_width(),
            mode,
        }
    }

    /// Analyzer with an explicit slot width in bytes.
    pub fn with_width(width: u64, mode: StackMode) -> Self {
        Self { width, mode }
    }

    /// Signed shift of a `ShiftStack` and the whole slots it covers.
    fn shift_slots(&self, stmt_index: usize, stmt: &IsilStatement) -> Result<(i64, usize), StackError> {
        let shift = match stmt.operands.first() {
            Some(IsilOperand::Immediate(value)) => value.as_i64(),
            _ => None,
        }
        .ok_or(StackError::MalformedShift { statement: stmt_index })?;

        let width = self.width as i64;
        if width == 0 || shift % width != 0 {
            return Err(StackError::Misaligned {
                statement: stmt_index,
                shift,
                width: self.width,
            });
        }
        Ok((shift, (shift.unsigned_abs() / self.width) as usize))
    }

    /// Argument slots released by `statements[index]` if it is the stack
    /// adjustment of a returning instruction.
    fn argument_release(&self, index: usize, statements: &[IsilStatement]) -> Result<Option<usize>, StackError> {
        let stmt = &statements[index];
        let returns = statements
            .get(index + 1)
            .is_some_and(|next| next.opcode == OpCode::Return && next.address == stmt.address);
        if stmt.opcode != OpCode::ShiftStack || !returns {
            return Ok(None);
        }
        let (shift, slots) = self.shift_slots(index, stmt)?;
        Ok((shift > 0).then_some(slots))
    }

    fn replay(
        &self,
        stmt_index: usize,
        stmt: &IsilStatement,
        state: &mut StackState,
    ) -> Result<(), StackError> {
        match stmt.opcode {
            OpCode::Push => state.push(StackSlot {
                kind: SlotKind::Value,
                origin: stmt_index,
            }),
            OpCode::Pop => {
                if !state.release(1) {
                    return Err(StackError::PopFromEmpty { statement: stmt_index });
                }
            }
            OpCode::ShiftStack => {
                let (shift, slots) = self.shift_slots(stmt_index, stmt)?;
                if shift < 0 {
                    for _ in 0..slots {
                        state.push(StackSlot {
                            kind: SlotKind::Reserved,
                            origin: stmt_index,
                        });
                    }
                } else if !state.release(slots) {
                    return Err(StackError::Underflow {
                        statement: stmt_index,
                        requested: slots,
                        depth: state.depth(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Verify stack discipline over every path of `cfg`.
    pub fn analyze(&self, cfg: &ControlFlowGraph) -> Result<StackSummary, StackError> {
        let block_count = cfg.block_count();
        let statements = cfg.statements();
        let mut incoming: Vec<Option<StackState>> = vec![None; block_count];
        let mut visited = vec![false; block_count];
        let mut depths = vec![None; statements.len()];
        let mut max_depth = 0;
        let mut tail_calls = 0;
        let mut argument_slots = 0;

        incoming[ENTRY] = Some(StackState::empty(self.mode));
        let mut work = vec![ENTRY];

        while let Some(id) = work.pop() {
            if std::mem::replace(&mut visited[id], true) {
                continue;
            }
            let block = &cfg.blocks()[id];
            let mut state = match &incoming[id] {
                Some(state) => state.clone(),
                None => continue,
            };

            for index in block.statements.clone() {
                depths[index] = Some(state.depth());
                if let Some(slots) = self.argument_release(index, statements)? {
                    argument_slots = argument_slots.max(slots);
                    continue;
                }
                self.replay(index, &statements[index], &mut state)?;
                max_depth = max_depth.max(state.depth());
            }

            if block.is_tail_call() {
                tail_calls += 1;
                state.clear();
            }

            for &succ in block.successors.iter().rev() {
                match &incoming[succ] {
                    None => {
                        incoming[succ] = Some(state.clone());
                        work.push(succ);
                    }
                    Some(recorded) if *recorded != state => {
                        return Err(StackError::MergeMismatch {
                            block: succ,
                            expected: recorded.depth(),
                            found: state.depth(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(exit) = &incoming[EXIT] {
            if !exit.is_empty() {
                return Err(StackError::NonEmptyExit { depth: exit.depth() });
            }
        }

        let visited_blocks = visited.iter().filter(|v| **v).count();
        log::debug!(
            "stack balanced over {} blocks (max depth {}, {} tail call(s))",
            visited_blocks,
            max_depth,
            tail_calls
        );

        Ok(StackSummary {
            mode: self.mode,
            max_depth,
            tail_calls,
            visited_blocks,
            argument_slots,
            trace: (self.mode == StackMode::Slots).then(|| StackTrace {
                width: self.width,
                depths,
            }),
        })
    }
}

/// Balanced/unbalanced routine counters, safe to share across threads.
#[derive(Debug, Default)]
pub struct StackTally {
    balanced: AtomicU64,
    unbalanced: AtomicU64,
}

impl StackTally {
    pub const fn new() -> Self {
        Self {
            balanced: AtomicU64::new(0),
            unbalanced: AtomicU64::new(0),
        }
    }

    /// Count one routine.
    pub fn record(&self, balanced: bool) {
        if balanced {
            self.balanced.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unbalanced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn balanced(&self) -> u64 {
        self.balanced.load(Ordering::Relaxed)
    }

    pub fn unbalanced(&self) -> u64 {
        self.unbalanced.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.balanced() + self.unbalanced()
    }
}

static GLOBAL_TALLY: StackTally = StackTally::new();

/// Process-wide tally fed by every batch run.
pub fn global_tally() -> &'static StackTally {
    &GLOBAL_TALLY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isil::{IsilOperand, IsilStatement, OpCode};

    fn routine(ops: Vec<(OpCode, Vec<IsilOperand>)>) -> ControlFlowGraph {
        let statements = ops
            .into_iter()
            .enumerate()
            .map(|(index, (opcode, operands))| IsilStatement {
                index,
                address: index as u64,
                opcode,
                operands,
            })
            .collect();
        ControlFlowGraph::build(statements).unwrap()
    }

    fn reg(name: &str) -> Vec<IsilOperand> {
        vec![IsilOperand::reg(name)]
    }

    fn shift(n: i64) -> (OpCode, Vec<IsilOperand>) {
        (OpCode::ShiftStack, vec![IsilOperand::int(n)])
    }

    fn both_modes() -> [StackAnalyzer; 2] {
        [
            StackAnalyzer::new(Architecture::X86_64, StackMode::Depth),
            StackAnalyzer::new(Architecture::X86_64, StackMode::Slots),
        ]
    }

    #[test]
    fn test_push_pop_is_balanced() {
        let cfg = routine(vec![
            (OpCode::Push, reg("RBP")),
            (OpCode::Pop, reg("RBP")),
            (OpCode::Return, vec![]),
        ]);
        for analyzer in both_modes() {
            let summary = analyzer.analyze(&cfg).unwrap();
            assert_eq!(summary.max_depth, 1);
            assert_eq!(summary.tail_calls, 0);
        }
    }

    #[test]
    fn test_missing_pop_is_unbalanced() {
        let cfg = routine(vec![(OpCode::Push, reg("RBP")), (OpCode::Return, vec![])]);
        for analyzer in both_modes() {
            assert_eq!(analyzer.analyze(&cfg).unwrap_err(), StackError::NonEmptyExit { depth: 1 });
        }
    }

    #[test]
    fn test_pop_from_empty() {
        let cfg = routine(vec![(OpCode::Pop, reg("RBP")), (OpCode::Return, vec![])]);
        let err = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth)
            .analyze(&cfg)
            .unwrap_err();
        assert_eq!(err, StackError::PopFromEmpty { statement: 0 });
    }

    #[test]
    fn test_tail_call_resets_state() {
        // push rbp; jmp elsewhere
        let cfg = routine(vec![
            (OpCode::Push, reg("RBP")),
            (OpCode::CallNoReturn, vec![IsilOperand::address(0x9000)]),
        ]);
        for analyzer in both_modes() {
            let summary = analyzer.analyze(&cfg).unwrap();
            assert_eq!(summary.tail_calls, 1);
        }
    }

    #[test]
    fn test_misaligned_shift() {
        let cfg = routine(vec![shift(3), (OpCode::Return, vec![])]);
        let err = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth)
            .analyze(&cfg)
            .unwrap_err();
        assert_eq!(
            err,
            StackError::Misaligned {
                statement: 0,
                shift: 3,
                width: 8
            }
        );
        // whole 4-byte slots on a 32-bit target
        let cfg = routine(vec![shift(-4), shift(4), (OpCode::Return, vec![])]);
        assert!(StackAnalyzer::new(Architecture::ArmV7, StackMode::Depth).analyze(&cfg).is_ok());
    }

    #[test]
    fn test_release_more_than_allocated() {
        let cfg = routine(vec![shift(-8), shift(16), (OpCode::Return, vec![])]);
        let err = StackAnalyzer::new(Architecture::X86_64, StackMode::Slots)
            .analyze(&cfg)
            .unwrap_err();
        assert!(matches!(err, StackError::Underflow { statement: 1, requested: 2, depth: 1 }));
    }

    #[test]
    fn test_return_releasing_arguments() {
        let at = |address: u64, opcode: OpCode, operands: Vec<IsilOperand>| IsilStatement {
            index: 0,
            address,
            opcode,
            operands,
        };
        // push rbx; pop rbx; ret 8
        let statements = vec![
            at(0x0, OpCode::Push, reg("RBX")),
            at(0x1, OpCode::Pop, reg("RBX")),
            at(0x2, OpCode::ShiftStack, vec![IsilOperand::int(8)]),
            at(0x2, OpCode::Return, vec![]),
        ];
        let cfg = ControlFlowGraph::build(statements.clone()).unwrap();
        for analyzer in both_modes() {
            let summary = analyzer.analyze(&cfg).unwrap();
            assert_eq!(summary.argument_slots, 1);
            assert_eq!(summary.max_depth, 1);
        }

        // the routine's own slots are not released by the return
        let mut leaky = statements;
        leaky.remove(1);
        let cfg = ControlFlowGraph::build(leaky).unwrap();
        let err = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth)
            .analyze(&cfg)
            .unwrap_err();
        assert_eq!(err, StackError::NonEmptyExit { depth: 1 });

        // a release from an earlier instruction still underflows
        let cfg = routine(vec![shift(8), (OpCode::Return, vec![])]);
        let err = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth)
            .analyze(&cfg)
            .unwrap_err();
        assert!(matches!(err, StackError::Underflow { statement: 0, .. }));
    }

    #[test]
    fn test_merge_mismatch() {
        // 0: cmp; 1: je @3; 2: push; 3: pop?; 4: ret
        let cfg = routine(vec![
            (OpCode::Compare, vec![]),
            (OpCode::JumpIfEqual, vec![IsilOperand::Statement(3)]),
            (OpCode::Push, reg("RAX")),
            (OpCode::Move, vec![]),
            (OpCode::Return, vec![]),
        ]);
        for analyzer in both_modes() {
            let err = analyzer.analyze(&cfg).unwrap_err();
            assert!(matches!(err, StackError::MergeMismatch { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_loop_with_balanced_body() {
        // 0: push; 1: push; 2: pop; 3: cmp; 4: jne @1; 5: pop; 6: ret
        let cfg = routine(vec![
            (OpCode::Push, reg("RBX")),
            (OpCode::Push, reg("RAX")),
            (OpCode::Pop, reg("RAX")),
            (OpCode::Compare, vec![]),
            (OpCode::JumpIfNotEqual, vec![IsilOperand::Statement(1)]),
            (OpCode::Pop, reg("RBX")),
            (OpCode::Return, vec![]),
        ]);
        for analyzer in both_modes() {
            let summary = analyzer.analyze(&cfg).unwrap();
            assert_eq!(summary.max_depth, 2);
        }
    }

    #[test]
    fn test_slot_kinds_must_agree_at_merges() {
        // one path pushes a value, the other reserves a slot
        let cfg = routine(vec![
            (OpCode::Compare, vec![]),
            (OpCode::JumpIfEqual, vec![IsilOperand::Statement(4)]),
            (OpCode::Push, reg("RAX")),
            (OpCode::Jump, vec![IsilOperand::Statement(5)]),
            shift(-8),
            shift(8),
            (OpCode::Return, vec![]),
        ]);
        let depth = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth).analyze(&cfg);
        assert!(depth.is_ok());
        let slots = StackAnalyzer::new(Architecture::X86_64, StackMode::Slots).analyze(&cfg);
        assert!(matches!(slots, Err(StackError::MergeMismatch { .. })));
    }

    #[test]
    fn test_trace_and_stack_offsets() {
        use crate::decoder::MemoryOperand;

        let sp_mem = |addend| {
            IsilOperand::Memory(MemoryOperand {
                base: Some("RSP".into()),
                index: None,
                scale: 1,
                addend,
            })
        };
        let cfg = routine(vec![
            (OpCode::Push, reg("RBP")),
            shift(-16),
            (OpCode::Move, vec![sp_mem(8), IsilOperand::reg("RCX")]),
            shift(16),
            (OpCode::Pop, reg("RBP")),
            (OpCode::Return, vec![]),
        ]);

        let depth = StackAnalyzer::new(Architecture::X86_64, StackMode::Depth).analyze(&cfg).unwrap();
        assert!(depth.trace.is_none());

        let summary = StackAnalyzer::new(Architecture::X86_64, StackMode::Slots).analyze(&cfg).unwrap();
        let trace = summary.trace.unwrap();
        assert_eq!(trace.depth_before(0), Some(0));
        assert_eq!(trace.depth_before(2), Some(3));
        assert_eq!(trace.frame_offset(2, 8), Some(8 - 24));

        let mut statements = cfg.statements().to_vec();
        assert_eq!(trace.rewrite_stack_operands(&mut statements, "RSP"), 1);
        assert_eq!(statements[2].operands[0], IsilOperand::StackOffset(-16));
    }

    #[test]
    fn test_tally_counts() {
        let tally = StackTally::new();
        tally.record(true);
        tally.record(false);
        tally.record(true);
        assert_eq!(tally.balanced(), 2);
        assert_eq!(tally.unbalanced(), 1);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    fn test_tally_is_shared_across_threads() {
        let tally = StackTally::new();
        std::thread::scope(|scope| {
            for n in 0..4 {
                let tally = &tally;
                scope.spawn(move || {
                    for _ in 0..100 {
                        tally.record(n % 2 == 0);
                    }
                });
            }
        });
        assert_eq!(tally.balanced(), 200);
        assert_eq!(tally.unbalanced(), 200);
    }
}
