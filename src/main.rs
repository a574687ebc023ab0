//! cognical-scheduler CLI: reads JSON snapshots, writes JSON schedules.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use cognical_scheduling_lib::models::pattern::HistoricalRecord;
use cognical_scheduling_lib::utils::logger::init_logging;
use cognical_scheduling_lib::{
    AppError, AppResult, CancellationSignal, EngineSettings, RescheduleRequest, ScheduleRequest,
    SchedulingEngine,
};

#[derive(Parser)]
#[command(name = "cognical-scheduler", version, about = "Pattern-aware schedule generation")]
struct Cli {
    /// Engine settings file (YAML or JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the daily rolling log file.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Stop searching after this many milliseconds and return a partial schedule.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Write the result here instead of stdout.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a schedule from a request snapshot.
    Plan {
        /// Path to a JSON `ScheduleRequest`.
        #[arg(long)]
        request: PathBuf,
    },

    /// Revise an existing schedule after a disruption.
    Reschedule {
        /// Path to a JSON `RescheduleRequest`.
        #[arg(long)]
        request: PathBuf,
    },

    /// Derive a pattern snapshot from historical records.
    Patterns {
        /// Path to a JSON array of historical records.
        #[arg(long)]
        history: PathBuf,
    },

    /// Print the effective engine settings.
    Settings,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_dir.as_deref()) {
        eprintln!("failed to initialise logging: {err}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target: "app::scheduler", error = %err, "command failed");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let settings = match &cli.config {
        Some(path) => EngineSettings::load_from_path(path)?,
        None => EngineSettings::default(),
    };
    let engine = SchedulingEngine::new(settings)?;

    let mut signal = CancellationSignal::new();
    if let Some(ms) = cli.timeout_ms {
        signal = signal.with_timeout(Duration::from_millis(ms));
    }

    match &cli.command {
        Commands::Plan { request } => {
            let request: ScheduleRequest = read_json(request)?;
            let schedule = engine.generate(&request, &signal)?;
            info!(
                target: "app::scheduler",
                schedule = %schedule.id,
                blocks = schedule.blocks.len(),
                conflicts = schedule.conflicts.len(),
                "plan written"
            );
            write_json(cli.output.as_deref(), &schedule)
        }
        Commands::Reschedule { request } => {
            let request: RescheduleRequest = read_json(request)?;
            let schedule = engine.reschedule(request, &signal)?;
            write_json(cli.output.as_deref(), &schedule)
        }
        Commands::Patterns { history } => {
            let records: Vec<HistoricalRecord> = read_json(history)?;
            write_json(cli.output.as_deref(), &engine.analyze_patterns(&records))
        }
        Commands::Settings => write_json(cli.output.as_deref(), engine.settings()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    if !path.exists() {
        return Err(AppError::not_found(path.display().to_string()));
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> AppResult<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }
    Ok(())
}
