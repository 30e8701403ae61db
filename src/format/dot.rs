//! Graphviz output: one cluster per routine that produced a graph.

use std::fmt::Write as _;

use super::{block_label, routine_status, AnalysisFormatter, FormatError};
use crate::cfg::{BlockKind, ENTRY, EXIT};
use crate::pipeline::BatchReport;
use crate::stack::StackTally;

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl AnalysisFormatter for super::DotFormatter {
    fn format(&self, report: &BatchReport, _tally: &StackTally) -> Result<String, FormatError> {
        let mut output = String::from("digraph isil {\n  node [shape=box, fontname=\"monospace\"];\n");

        for (n, routine) in report.routines.iter().enumerate() {
            let Ok(analysis) = &routine.outcome else {
                continue;
            };
            let (status, _) = routine_status(routine);
            let _ = writeln!(output, "  subgraph cluster_{} {{", n);
            let _ = writeln!(
                output,
                "    label=\"{} @ 0x{:x} ({})\";",
                escape(&routine.name),
                routine.address,
                status
            );

            for block in analysis.cfg.blocks() {
                let node = format!("r{}_b{}", n, block.id);
                match block.id {
                    ENTRY | EXIT => {
                        let _ = writeln!(
                            output,
                            "    {} [shape=oval, label=\"{}\"];",
                            node,
                            block_label(&analysis.cfg, block.id)
                        );
                    }
                    _ => {
                        let mut label = format!("{}\\l", escape(&block_label(&analysis.cfg, block.id)));
                        for stmt in &analysis.statements[block.statements.clone()] {
                            label.push_str(&escape(&stmt.to_string()));
                            label.push_str("\\l");
                        }
                        let style = if block.kind == BlockKind::Call { ", style=bold" } else { "" };
                        let _ = writeln!(output, "    {} [label=\"{}\"{}];", node, label, style);
                    }
                }
            }

            for (from, to) in analysis.cfg.edges() {
                let _ = writeln!(output, "    r{}_b{} -> r{}_b{};", n, from, n, to);
            }
            output.push_str("  }\n");
        }

        output.push_str("}\n");
        Ok(output)
    }
}
