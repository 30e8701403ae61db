use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use isil_lift::format::OutputFormat;
use isil_lift::isil::{LiftOptions, UnknownInstructionPolicy, WasmSignature};
use isil_lift::pipeline::{analyze_batch, analyze_batch_with_jobs, AnalysisOptions, Routine};
use isil_lift::stack::{self, StackMode};
use isil_lift::{loader, Address, Architecture};

/// Lift routines to ISIL, build their control-flow graphs and verify stack balance
#[derive(Parser, Debug)]
#[command(name = "isil-lift", version, about)]
struct Cli {
    /// ELF or PE image, or a raw routine body with --raw
    input: PathBuf,

    /// Source architecture; required with --raw, overrides detection otherwise
    #[arg(short, long, value_enum)]
    arch: Option<Architecture>,

    /// Treat the input as a single raw routine body
    #[arg(long)]
    raw: bool,

    /// Load address of a raw routine (hex with 0x prefix, or decimal)
    #[arg(long, default_value = "0", value_parser = parse_address)]
    base: Address,

    /// Only analyze routines whose name contains this text
    #[arg(short, long)]
    routine: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Stack tracking granularity
    #[arg(long, value_enum, default_value_t = StackMode::Depth)]
    stack_mode: StackMode,

    /// Emit placeholders for instructions without a lifting rule instead of failing
    #[arg(long)]
    lenient: bool,

    /// Result count of a raw WASM body
    #[arg(long, default_value_t = 0)]
    wasm_results: usize,

    /// Worker threads (defaults to available parallelism)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(s: &str) -> Result<Address, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Address::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{}`: {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("isil_lift", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let (architecture, mut routines, literals) = if cli.raw {
        let Some(arch) = cli.arch else {
            bail!("--arch is required with --raw");
        };
        let bytes = fs::read(&cli.input).with_context(|| format!("failed to read {}", cli.input.display()))?;
        let name = cli
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "routine".to_string());
        let mut routine = Routine::new(name, cli.base, &bytes);
        if arch == Architecture::Wasm {
            routine = routine.with_signature(WasmSignature::new(0, cli.wasm_results));
        }
        (arch, vec![routine], None)
    } else {
        let loaded =
            loader::load_file(&cli.input).with_context(|| format!("failed to load {}", cli.input.display()))?;
        let arch = cli.arch.unwrap_or(loaded.architecture);
        (arch, loaded.routines, Some(loaded.literals))
    };

    if let Some(filter) = &cli.routine {
        routines.retain(|r| r.name.contains(filter.as_str()));
    }
    if routines.is_empty() {
        bail!("no routines to analyze in {}", cli.input.display());
    }

    let mut options = AnalysisOptions::new(architecture)
        .with_stack_mode(cli.stack_mode)
        .with_lift_options(LiftOptions {
            unknown: if cli.lenient {
                UnknownInstructionPolicy::Placeholder
            } else {
                UnknownInstructionPolicy::Strict
            },
            ..LiftOptions::default()
        });
    if let Some(literals) = literals {
        options = options.with_literals(Arc::new(literals));
    }

    let tally = stack::global_tally();
    let report = match cli.jobs {
        Some(jobs) => analyze_batch_with_jobs(&routines, &options, tally, jobs).context("failed to build thread pool")?,
        None => analyze_batch(&routines, &options, tally),
    };

    let rendered = cli
        .format
        .get_formatter()
        .format(&report, tally)
        .with_context(|| format!("failed to render {} output", cli.format))?;

    match &cli.output {
        Some(path) => {
            fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("wrote {} output to {}", cli.format, path.display());
        }
        None => print!("{}", rendered),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_aliases_on_the_command_line() {
        let cli = Cli::try_parse_from(["isil-lift", "image.elf", "--format", "graphviz"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Dot);

        let cli = Cli::try_parse_from(["isil-lift", "image.elf", "-f", "jsonlines"]).unwrap();
        assert_eq!(cli.format, OutputFormat::JsonLines);

        assert!(Cli::try_parse_from(["isil-lift", "image.elf", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_raw_routine_arguments() {
        let cli = Cli::try_parse_from([
            "isil-lift",
            "body.wasm",
            "--raw",
            "--arch",
            "wasm",
            "--base",
            "0x400",
            "--wasm-results",
            "1",
        ])
        .unwrap();
        assert!(cli.raw);
        assert_eq!(cli.arch, Some(Architecture::Wasm));
        assert_eq!(cli.base, 0x400);
        assert_eq!(cli.wasm_results, 1);
        assert_eq!(parse_address("17"), Ok(17));
        assert!(parse_address("0xzz").is_err());
    }
}
