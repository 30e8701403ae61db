//! JSON and JSON Lines output formatters

use serde::Serialize;

use super::{block_label, routine_status, AnalysisFormatter, FormatError};
use crate::cfg::{Block, ControlFlowGraph};
use crate::pipeline::{BatchReport, RoutineReport};
use crate::stack::{StackSummary, StackTally};

/// Serializable basic block for JSON output
#[derive(Serialize)]
struct BlockJson {
    /// Arena id of the block
    id: usize,
    /// "entry", "exit", "normal" or "call"
    kind: String,
    /// Display label, including the first statement address
    label: String,
    /// Rendered ISIL statements
    statements: Vec<String>,
    /// Successor block ids
    successors: Vec<usize>,
}

/// Serializable stack result for JSON output
#[derive(Serialize)]
struct StackJson {
    mode: String,
    max_depth: usize,
    tail_calls: usize,
    visited_blocks: usize,
    argument_slots: usize,
}

/// Serializable routine result for JSON output
#[derive(Serialize)]
struct RoutineJson {
    name: String,
    /// Start address as hex string
    address: String,
    /// "balanced", "unbalanced" or "faulted"
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rewrites: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<StackJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocks: Vec<BlockJson>,
}

/// Serializable batch counts for JSON output
#[derive(Serialize)]
struct SummaryJson {
    architecture: String,
    balanced: u64,
    unbalanced: u64,
    faulted: u64,
    tally_balanced: u64,
    tally_unbalanced: u64,
}

/// Serializable batch for JSON output
#[derive(Serialize)]
struct BatchJson {
    routines: Vec<RoutineJson>,
    summary: SummaryJson,
}

impl AnalysisFormatter for super::JsonFormatter {
    fn format(&self, report: &BatchReport, tally: &StackTally) -> Result<String, FormatError> {
        let batch = BatchJson {
            routines: report.routines.iter().map(routine_to_json).collect(),
            summary: summary_to_json(report, tally),
        };
        Ok(serde_json::to_string_pretty(&batch)?)
    }
}

impl AnalysisFormatter for super::JsonLinesFormatter {
    fn format(&self, report: &BatchReport, tally: &StackTally) -> Result<String, FormatError> {
        let mut output = String::new();

        for routine in &report.routines {
            output.push_str(&serde_json::to_string(&routine_to_json(routine))?);
            output.push('\n');
        }
        output.push_str(&serde_json::to_string(&summary_to_json(report, tally))?);
        output.push('\n');

        Ok(output)
    }
}

fn summary_to_json(report: &BatchReport, tally: &StackTally) -> SummaryJson {
    SummaryJson {
        architecture: report.architecture.to_string(),
        balanced: report.summary.balanced,
        unbalanced: report.summary.unbalanced,
        faulted: report.summary.faulted,
        tally_balanced: tally.balanced(),
        tally_unbalanced: tally.unbalanced(),
    }
}

fn stack_to_json(summary: &StackSummary) -> StackJson {
    StackJson {
        mode: summary.mode.to_string(),
        max_depth: summary.max_depth,
        tail_calls: summary.tail_calls,
        visited_blocks: summary.visited_blocks,
        argument_slots: summary.argument_slots,
    }
}

fn block_to_json(cfg: &ControlFlowGraph, block: &Block, statements: &[crate::isil::IsilStatement]) -> BlockJson {
    BlockJson {
        id: block.id,
        kind: format!("{:?}", block.kind).to_lowercase(),
        label: block_label(cfg, block.id),
        statements: statements[block.statements.clone()].iter().map(ToString::to_string).collect(),
        successors: block.successors.clone(),
    }
}

fn routine_to_json(routine: &RoutineReport) -> RoutineJson {
    let (status, error) = routine_status(routine);
    let mut json = RoutineJson {
        name: routine.name.clone(),
        address: format!("0x{:x}", routine.address),
        status: status.to_string(),
        error,
        instructions: None,
        rewrites: None,
        stack: None,
        blocks: Vec::new(),
    };

    if let Ok(analysis) = &routine.outcome {
        json.instructions = Some(analysis.instructions.len());
        json.rewrites = Some(analysis.rewrites);
        json.stack = analysis.stack.as_ref().ok().map(stack_to_json);
        json.blocks = analysis
            .cfg
            .blocks()
            .iter()
            .map(|block| block_to_json(&analysis.cfg, block, &analysis.statements))
            .collect();
    }

    json
}
