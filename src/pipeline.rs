//! Per-routine analysis and the parallel batch runner.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::cfg::ControlFlowGraph;
use crate::decoder::{Disassembler, Instruction};
use crate::isil::{self, IsilStatement, LiftOptions, LiteralLookup, LiteralRewrite, WasmSignature};
use crate::stack::{StackAnalyzer, StackError, StackMode, StackSummary, StackTally};
use crate::{Address, AnalysisError, Architecture};

/// A routine body to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub name: String,
    pub address: Address,
    pub bytes: Vec<u8>,
    /// WASM function type of this body, overriding the context's result count
    pub signature: Option<WasmSignature>,
}

impl Routine {
    pub fn new(name: impl Into<String>, address: Address, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            address,
            bytes: bytes.to_vec(),
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: WasmSignature) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Everything a routine analysis needs besides the bytes.
#[derive(Clone)]
pub struct AnalysisOptions {
    pub architecture: Architecture,
    pub stack_mode: StackMode,
    pub lift: LiftOptions,
    pub literals: Option<Arc<dyn LiteralLookup>>,
}

impl AnalysisOptions {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            stack_mode: StackMode::default(),
            lift: LiftOptions::default(),
            literals: None,
        }
    }

    pub fn with_stack_mode(mut self, mode: StackMode) -> Self {
        self.stack_mode = mode;
        self
    }

    pub fn with_lift_options(mut self, lift: LiftOptions) -> Self {
        self.lift = lift;
        self
    }

    pub fn with_literals(mut self, literals: Arc<dyn LiteralLookup>) -> Self {
        self.literals = Some(literals);
        self
    }
}

impl fmt::Debug for AnalysisOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisOptions")
            .field("architecture", &self.architecture)
            .field("stack_mode", &self.stack_mode)
            .field("lift", &self.lift)
            .field("literals", &self.literals.is_some())
            .finish()
    }
}

/// Output of one routine that decoded, lifted and formed a valid graph.
#[derive(Debug, Clone)]
pub struct RoutineAnalysis {
    pub instructions: Vec<Instruction>,
    /// Final statement list; in slots mode stack-pointer operands are
    /// replaced by frame offsets
    pub statements: Vec<IsilStatement>,
    pub cfg: ControlFlowGraph,
    /// Operands replaced by post-lift rewrites
    pub rewrites: usize,
    pub stack: Result<StackSummary, StackError>,
}

impl RoutineAnalysis {
    pub fn is_balanced(&self) -> bool {
        self.stack.is_ok()
    }
}

/// Decode, lift, rewrite, build the graph and verify the stack.
///
/// Stack faults are part of the returned analysis; every earlier fault
/// aborts the routine.
pub fn analyze_routine(routine: &Routine, options: &AnalysisOptions) -> Result<RoutineAnalysis, AnalysisError> {
    let arch = options.architecture;
    let disassembly = Disassembler::for_architecture(arch).decode_all(&routine.bytes, routine.address)?;

    let mut statements = match routine.signature {
        Some(signature) => {
            let mut lift = options.lift.clone();
            lift.wasm.results = signature.results;
            isil::lift(arch, &disassembly.instructions, &lift)?
        }
        None => isil::lift(arch, &disassembly.instructions, &options.lift)?,
    };

    let rewrites = match &options.literals {
        Some(lookup) => {
            let literal = LiteralRewrite::new(Arc::clone(lookup));
            isil::apply_rewrites(&mut statements, &[&literal])
        }
        None => 0,
    };

    let cfg = ControlFlowGraph::build(statements.clone())?;
    let stack = StackAnalyzer::new(arch, options.stack_mode).analyze(&cfg);

    if let (Ok(StackSummary { trace: Some(trace), .. }), Some(sp)) = (&stack, arch.stack_pointer()) {
        let translated = trace.rewrite_stack_operands(&mut statements, sp);
        log::debug!("{}: {} stack operand(s) translated", routine.name, translated);
    }

    Ok(RoutineAnalysis {
        instructions: disassembly.instructions,
        statements,
        cfg,
        rewrites,
        stack,
    })
}

/// One routine of a batch with its outcome.
#[derive(Debug)]
pub struct RoutineReport {
    pub name: String,
    pub address: Address,
    pub outcome: Result<RoutineAnalysis, AnalysisError>,
}

impl RoutineReport {
    pub fn is_balanced(&self) -> bool {
        self.outcome.as_ref().is_ok_and(RoutineAnalysis::is_balanced)
    }
}

/// Counts over a batch. `faulted` routines never reached the stack analysis
/// and are included in `unbalanced`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub balanced: u64,
    pub unbalanced: u64,
    pub faulted: u64,
}

impl BatchSummary {
    pub fn total(&self) -> u64 {
        self.balanced + self.unbalanced
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub architecture: Architecture,
    pub summary: BatchSummary,
    pub routines: Vec<RoutineReport>,
}

/// Analyze every routine on the current rayon pool.
///
/// Each routine is recorded in `tally` once. A fault in one routine never
/// affects its siblings.
pub fn analyze_batch(routines: &[Routine], options: &AnalysisOptions, tally: &StackTally) -> BatchReport {
    log::info!(
        "analyzing {} {} routine(s) on {} thread(s)",
        routines.len(),
        options.architecture,
        rayon::current_num_threads()
    );
    let start_time = Instant::now();

    let reports: Vec<RoutineReport> = routines
        .par_iter()
        .map(|routine| {
            let outcome = analyze_routine(routine, options);
            match &outcome {
                Ok(analysis) => {
                    if let Err(e) = &analysis.stack {
                        log::warn!("{} (0x{:x}): unbalanced: {}", routine.name, routine.address, e);
                    }
                    tally.record(analysis.is_balanced());
                }
                Err(e) => {
                    log::warn!("{} (0x{:x}): {}", routine.name, routine.address, e);
                    tally.record(false);
                }
            }
            RoutineReport {
                name: routine.name.clone(),
                address: routine.address,
                outcome,
            }
        })
        .collect();

    let mut summary = BatchSummary::default();
    for report in &reports {
        match &report.outcome {
            Ok(analysis) if analysis.is_balanced() => summary.balanced += 1,
            Ok(_) => summary.unbalanced += 1,
            Err(_) => {
                summary.unbalanced += 1;
                summary.faulted += 1;
            }
        }
    }

    log::info!(
        "batch completed in {:?}: {} balanced, {} unbalanced ({} faulted)",
        start_time.elapsed(),
        summary.balanced,
        summary.unbalanced,
        summary.faulted
    );

    BatchReport {
        architecture: options.architecture,
        summary,
        routines: reports,
    }
}

/// [`analyze_batch`] on a dedicated pool of `jobs` threads.
pub fn analyze_batch_with_jobs(
    routines: &[Routine],
    options: &AnalysisOptions,
    tally: &StackTally,
    jobs: usize,
) -> Result<BatchReport, rayon::ThreadPoolBuildError> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    Ok(pool.install(|| analyze_batch(routines, options, tally)))
}
