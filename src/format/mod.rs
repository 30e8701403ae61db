//! Output format module implementation

mod csv;
mod dot;
mod json;

pub use self::csv::*;
pub use self::dot::*;
pub use self::json::*;

use std::fmt;
use std::fmt::Write as _;

use clap::ValueEnum;

use crate::cfg::ControlFlowGraph;
use crate::pipeline::{BatchReport, RoutineReport};
use crate::stack::StackTally;

/// Supported output formats for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text listing (default)
    #[default]
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per routine)
    #[value(name = "jsonl", alias = "jsonlines")]
    JsonLines,
    /// CSV format (one row per ISIL statement)
    Csv,
    /// Graphviz digraph of every control-flow graph
    #[value(alias = "graphviz")]
    Dot,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Dot => write!(f, "dot"),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
            OutputFormat::Dot,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn AnalysisFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
            OutputFormat::Dot => Box::new(DotFormatter),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV serialization failed: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("CSV output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("CSV writer could not be flushed: {0}")]
    Flush(String),
}

/// Formatter trait for batch analysis output
pub trait AnalysisFormatter {
    /// Format a batch report together with the running tally
    fn format(&self, report: &BatchReport, tally: &StackTally) -> Result<String, FormatError>;
}

/// Format analysis in plain text
pub struct TextFormatter;

/// Format analysis in JSON
pub struct JsonFormatter;

/// Format analysis in JSON Lines
pub struct JsonLinesFormatter;

/// Format analysis in CSV
pub struct CsvFormatter;

/// Format control-flow graphs as Graphviz
pub struct DotFormatter;

/// Status label and detail message of one routine.
pub(crate) fn routine_status(report: &RoutineReport) -> (&'static str, Option<String>) {
    match &report.outcome {
        Ok(analysis) => match &analysis.stack {
            Ok(_) => ("balanced", None),
            Err(e) => ("unbalanced", Some(e.to_string())),
        },
        Err(e) => ("faulted", Some(e.to_string())),
    }
}

pub(crate) fn block_label(cfg: &ControlFlowGraph, id: usize) -> String {
    match id {
        crate::cfg::ENTRY => "entry".to_string(),
        crate::cfg::EXIT => "exit".to_string(),
        _ => match cfg.block_statements(id).first() {
            Some(first) => format!("b{} @ 0x{:x}", id, first.address),
            None => format!("b{}", id),
        },
    }
}

impl AnalysisFormatter for TextFormatter {
    fn format(&self, report: &BatchReport, tally: &StackTally) -> Result<String, FormatError> {
        let mut output = String::new();

        for routine in &report.routines {
            let (status, detail) = routine_status(routine);
            let _ = writeln!(output, "{} at 0x{:08x} [{}]", routine.name, routine.address, status);
            if let Some(detail) = detail {
                let _ = writeln!(output, "  ! {}", detail);
            }

            let Ok(analysis) = &routine.outcome else {
                output.push('\n');
                continue;
            };

            for block in analysis.cfg.blocks().iter().skip(2) {
                let _ = writeln!(output, "  {}:", block_label(&analysis.cfg, block.id));
                for stmt in &analysis.statements[block.statements.clone()] {
                    let _ = writeln!(output, "    0x{:08x}  {}", stmt.address, stmt);
                }
                let succs = block
                    .successors
                    .iter()
                    .map(|s| block_label(&analysis.cfg, *s))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(output, "    -> {}", succs);
            }
            if let Ok(summary) = &analysis.stack {
                let _ = writeln!(
                    output,
                    "  stack: max depth {}, {} tail call(s)",
                    summary.max_depth, summary.tail_calls
                );
            }
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "{}: {} balanced, {} unbalanced ({} faulted); running tally {}/{}",
            report.architecture,
            report.summary.balanced,
            report.summary.unbalanced,
            report.summary.faulted,
            tally.balanced(),
            tally.total()
        );

        Ok(output)
    }
}
