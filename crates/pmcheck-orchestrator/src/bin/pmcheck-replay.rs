//! pmcheck-replay: re-check recorded trace streams offline.

use clap::Parser;
use pmcheck_detector::{Addr2Line, NoSymbols, SymbolResolver};
use pmcheck_orchestrator::{replay_recording, ReplayError};
use pmcheck_shadow::ShadowConfig;
use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"), context(false))]
    Replay { source: ReplayError },
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: std::io::Error },
    #[snafu(display("JSON error: {source}"), context(false))]
    Json { source: serde_json::Error },
}

#[derive(Parser)]
#[command(name = "pmcheck-replay")]
#[command(about = "Re-run the pmcheck detector over recorded trace streams")]
#[command(version)]
struct Cli {
    /// Recorded pre-failure stream (pre.trace)
    #[arg(long)]
    pre: PathBuf,

    /// Recorded recovery streams, in failure-point order
    #[arg(long)]
    post: Vec<PathBuf>,

    /// Write the report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Resolve diagnostic addresses against this executable
    #[arg(long)]
    addr2line: Option<PathBuf>,

    /// addr2line binary to run (e.g. a cross toolchain's)
    #[arg(long, default_value = "addr2line")]
    addr2line_tool: String,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let resolver: Box<dyn SymbolResolver> = match cli.addr2line {
        Some(exe) => Box::new(Addr2Line::new(exe).with_program(cli.addr2line_tool)),
        None => Box::new(NoSymbols),
    };

    eprintln!("Replaying {:?} with {} recovery streams...", cli.pre, cli.post.len());
    let report = replay_recording(&cli.pre, &cli.post, ShadowConfig::default(), resolver)?;
    eprintln!("{}", report.render());

    if let Some(path) = cli.report {
        std::fs::write(&path, report.to_json()?)?;
        eprintln!("Saved JSON report to {:?}", path);
    }
    Ok(())
}
