//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cosci")]
#[command(about = "Cosci - research hypothesis orchestration core", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of .cosci/ and COSCI_* variables
    #[arg(short, long, global = true, env = "COSCI_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration
    Config,

    /// Show supervisor statistics, queue depth and leaders from a checkpoint
    Status {
        /// Checkpoint file (defaults to storage.checkpoint_path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Show the tournament leaderboard from a checkpoint
    Standings {
        /// Checkpoint file (defaults to storage.checkpoint_path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Maximum number of hypotheses to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}
