//! CSV output formatter

use serde::Serialize;

use super::{routine_status, AnalysisFormatter, FormatError};
use crate::pipeline::BatchReport;
use crate::stack::StackTally;

/// One ISIL statement per row; faulted routines get a single row with no
/// statement columns.
#[derive(Serialize)]
struct StatementRow<'a> {
    routine: &'a str,
    routine_address: String,
    status: &'static str,
    block: Option<usize>,
    index: Option<usize>,
    address: Option<String>,
    opcode: Option<String>,
    operands: Option<String>,
    stack_depth: Option<usize>,
}

impl AnalysisFormatter for super::CsvFormatter {
    fn format(&self, report: &BatchReport, _tally: &StackTally) -> Result<String, FormatError> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());

        for routine in &report.routines {
            let (status, _) = routine_status(routine);
            let routine_address = format!("0x{:x}", routine.address);

            let Ok(analysis) = &routine.outcome else {
                writer.serialize(StatementRow {
                    routine: &routine.name,
                    routine_address,
                    status,
                    block: None,
                    index: None,
                    address: None,
                    opcode: None,
                    operands: None,
                    stack_depth: None,
                })?;
                continue;
            };

            let trace = analysis.stack.as_ref().ok().and_then(|s| s.trace.as_ref());
            for stmt in &analysis.statements {
                let operands = stmt
                    .operands
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                writer.serialize(StatementRow {
                    routine: &routine.name,
                    routine_address: routine_address.clone(),
                    status,
                    block: analysis.cfg.block_of_statement(stmt.index),
                    index: Some(stmt.index),
                    address: Some(format!("0x{:x}", stmt.address)),
                    opcode: Some(stmt.opcode.to_string()),
                    operands: Some(operands),
                    stack_depth: trace.and_then(|t| t.depth_before(stmt.index)),
                })?;
            }
        }

        let bytes = writer.into_inner().map_err(|e| FormatError::Flush(e.to_string()))?;
        Ok(String::from_utf8(bytes)?)
    }
}
