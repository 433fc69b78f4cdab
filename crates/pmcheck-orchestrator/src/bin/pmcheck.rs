//! pmcheck CLI: run a PM program under failure injection and report
//! crash-consistency bugs.

use clap::Parser;
use pmcheck_detector::Addr2Line;
use pmcheck_orchestrator::{
    ChannelError, FifoTransport, LaunchConfig, LaunchError, Orchestrator, OrchestratorConfig,
    OrchestratorError, PinLauncher,
};
use pmcheck_protocol::DEFAULT_FIFO_DIR;
use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"), context(false))]
    Channel { source: ChannelError },
    #[snafu(display("{source}"), context(false))]
    Launch { source: LaunchError },
    #[snafu(display("{source}"), context(false))]
    Run { source: OrchestratorError },
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: std::io::Error },
    #[snafu(display("JSON error: {source}"), context(false))]
    Json { source: serde_json::Error },
}

#[derive(Parser)]
#[command(name = "pmcheck")]
#[command(about = "Crash-consistency checker for persistent-memory programs")]
#[command(version)]
struct Cli {
    /// Instrumentation tool loaded into the target
    pintool: PathBuf,

    /// PM image; replaces __POOL_IMAGE__ in the target command
    pm_image: PathBuf,

    /// File listing the failure points to inject
    #[arg(long)]
    failure_points: Option<PathBuf>,

    /// Session id shared with the instrumentation tool (default: own pid)
    #[arg(long)]
    session: Option<u32>,

    /// Directory holding the session's named pipes
    #[arg(long, default_value = DEFAULT_FIFO_DIR)]
    fifo_dir: PathBuf,

    /// Seconds without pre-failure trace data before giving up
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,

    /// Seconds each recovery run may take
    #[arg(long, default_value_t = 20)]
    post_timeout: u64,

    /// Write the full report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Save raw trace streams under this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Resolve diagnostic addresses against this executable
    #[arg(long)]
    addr2line: Option<PathBuf>,

    /// addr2line binary to run (e.g. a cross toolchain's)
    #[arg(long, default_value = "addr2line")]
    addr2line_tool: String,

    /// Target command; one argument must contain __POOL_IMAGE__
    #[arg(last = true, required = true)]
    target: Vec<String>,
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
    let session = cli.session.unwrap_or_else(std::process::id);
    if let Some(dir) = &cli.record_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut launch = LaunchConfig::new(cli.pintool, cli.pm_image, cli.target).with_env();
    launch.session = session;
    launch.failure_points = cli.failure_points;
    let launcher = PinLauncher::new(launch)?;
    let transport = FifoTransport::create(&cli.fifo_dir, session)?;

    let config = OrchestratorConfig {
        idle_timeout: Duration::from_secs(cli.idle_timeout),
        post_timeout: Duration::from_secs(cli.post_timeout),
        record_dir: cli.record_dir,
        ..Default::default()
    };
    let mut orchestrator = Orchestrator::new(config, launcher, transport);
    if let Some(exe) = cli.addr2line {
        let resolver = Addr2Line::new(exe).with_program(cli.addr2line_tool);
        orchestrator = orchestrator.with_resolver(Box::new(resolver));
    }

    let report = orchestrator.run()?;
    eprintln!("{}", report.render());

    if let Some(path) = cli.report {
        std::fs::write(&path, report.to_json()?)?;
        eprintln!("Saved JSON report to {:?}", path);
    }
    Ok(())
}
