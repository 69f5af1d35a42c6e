// boreas_sim/src/main.rs

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use boreas_core::types::RunStatus;
use boreas_sim::batch::{run_batch, BatchEntry};
use boreas_sim::cli::Cli;
use boreas_sim::runner::CancelToken;
use boreas_sim::scenario::Scenario;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let paths = scenario_paths(&cli.scenario);
    if paths.is_empty() {
        error!(path = %cli.scenario.display(), "no scenario files found");
        return ExitCode::FAILURE;
    }

    let mut entries = Vec::new();
    for path in &paths {
        let mut scenario = match Scenario::from_file(path) {
            Ok(s) => s,
            Err(e) => {
                error!(path = %path.display(), "{e}");
                return ExitCode::FAILURE;
            }
        };
        if let Some(seed) = cli.seed {
            scenario.run.seed = seed;
        }
        match scenario.build() {
            Ok(experiment) => entries.push(BatchEntry {
                label: scenario.label(),
                experiment,
            }),
            Err(e) => {
                error!(path = %path.display(), "{e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let records = run_batch(&entries, &CancelToken::new());

    // Summary table: error statistics over the last half of the run, where
    // the filters have forgotten their initialization.
    println!();
    println!(
        "{:<20} {:>10} {:>10} {:>10}  status",
        "scenario", "rmse_f", "rmse_a", "spread_a"
    );
    for (label, record) in &records {
        let stats = &record.stats;
        let status = match record.status {
            RunStatus::Completed => "ok".to_string(),
            RunStatus::Diverged { step } => format!("diverged@{step}"),
            RunStatus::Cancelled { step } => format!("cancelled@{step}"),
        };
        println!(
            "{:<20} {:>10.4} {:>10.4} {:>10.4}  {}",
            label,
            stats.rmse_f.mean_over_last(0.5),
            stats.rmse_a.mean_over_last(0.5),
            stats.spread_a.mean_over_last(0.5),
            status
        );
    }

    ExitCode::SUCCESS
}

fn scenario_paths(root: &PathBuf) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.clone()];
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    paths.sort();
    paths
}
