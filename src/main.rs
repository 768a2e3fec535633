//! Command-line tomography scan runner.
//!
//! Loads a YAML scan document, validates it, and either describes the
//! resulting scan (`--dry-run`) or executes it against the simulated
//! beamline, printing the final scan report as JSON.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tomo_scan::config::load_scan_file;
use tomo_scan::devices::mock::MockBeamline;
use tomo_scan::report::ScanStatus;
use tomo_scan::sequencer::{summarize, Sequencer};
use tomo_scan::suspender::{ManualSignal, SuspendCondition, Suspender};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "tomo-scan", version, about = "Run a tomography scan from a YAML scan document")]
struct Cli {
    /// Scan document (YAML).
    config: PathBuf,

    /// Validate and describe the scan without touching hardware.
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("tomo_scan=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tomo_scan=info,warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_scan_file(&cli.config)
        .with_context(|| format!("invalid scan document {}", cli.config.display()))?;

    if cli.dry_run {
        for line in summarize(&config) {
            println!("{line}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Simulated station; a deployment wires real device drivers in here.
    let beamline = MockBeamline::new();
    let ring_current = ManualSignal::new("ring_current", 102.0);
    let suspender =
        Suspender::install(&ring_current, SuspendCondition { floor: 2.0, resume: 10.0 })?;

    let mut sequencer = Sequencer::new(&beamline.devices, config)?;
    sequencer.install_suspender(suspender);

    info!(config = %cli.config.display(), "starting scan");
    let report = sequencer.run().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.status {
        ScanStatus::Completed => ExitCode::SUCCESS,
        ScanStatus::Failed => ExitCode::FAILURE,
    })
}
