// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use clap::{Parser, Subcommand};
use hsvm_cli::commands::{inspect, timeline, verify};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hsvm")]
#[command(about = "Offline inspection of an hsvm node's data directory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the log and column status of a data directory.
    Inspect {
        #[arg(long, short)]
        dir: PathBuf,
    },
    /// Check log checksums and recompute every event's hashes.
    Verify {
        #[arg(long, short)]
        dir: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List events in commit order.
    Timeline {
        #[arg(long, short)]
        dir: PathBuf,

        /// Only events of this room.
        #[arg(long, short)]
        room: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { dir } => inspect::run(&dir),
        Commands::Verify { dir, json } => verify::run(&dir, json),
        Commands::Timeline { dir, room } => timeline::run(&dir, room.as_deref()),
    }
}
