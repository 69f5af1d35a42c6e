// boreas_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Boreas: twin-experiment harness for ensemble data assimilation.
///
/// This struct defines the command-line arguments that can be passed to any
/// binary application that uses the Boreas harness library.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a scenario TOML file, or a directory of scenario files to
    /// run as one batch.
    #[arg(short, long, default_value = "scenarios")]
    pub scenario: PathBuf,

    /// Override the seed of every loaded scenario.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Suppress per-run logging; only the final summary table is printed.
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}
