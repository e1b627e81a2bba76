//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Golf-simulator bay booking.
///
/// Keeps a timed booking queue per bay and switches each bay's smart plug on
/// while a customer's session runs.
#[derive(Debug, Parser)]
#[command(name = "bay", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the booking engine with an interactive console on stdin.
    Run {
        /// Use N simulated devices instead of the Kasa cloud.
        #[arg(long, value_name = "N")]
        simulate: Option<usize>,
    },

    /// Show session statistics from the archive.
    Stats {
        /// Limit to one device ID.
        #[arg(long)]
        device: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export every device's archive as JSON.
    Export,

    /// List known devices.
    Devices,
}
