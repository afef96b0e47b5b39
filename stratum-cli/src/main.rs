//! Stratum CLI - exercise the allocators and batch encoder on a host kernel.

mod commands;
mod observability;

use anyhow::Result;
use clap::{Parser, Subcommand};
use observability::{TracingConfig, init_tracing};
use std::path::PathBuf;

/// Stratum - GPU block pools, state allocators and command batches.
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer the block and state pools from many threads
    Stress {
        /// Worker threads
        #[arg(short, long, default_value = "8")]
        threads: usize,

        /// Operations per thread
        #[arg(short, long, default_value = "10000")]
        iterations: usize,

        /// Block size of the pool under test
        #[arg(short, long, default_value = "4096")]
        block_size: u32,

        /// Seed for the per-thread operation mix
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record synthetic commands, submit them and show the buffer table
    Record {
        /// Number of commands, each with one relocation
        #[arg(short = 'n', long, default_value = "1000")]
        commands: u32,

        /// Device configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective device configuration as YAML
    Config {
        /// Configuration file to load instead of the defaults
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&TracingConfig::from_env(cli.verbose))?;

    match cli.command {
        Commands::Stress {
            threads,
            iterations,
            block_size,
            seed,
            json,
        } => commands::stress::run(threads, iterations, block_size, seed, json),
        Commands::Record {
            commands,
            config,
            json,
        } => commands::record::run(commands, config.as_deref(), json),
        Commands::Config { file } => commands::config::run(file.as_deref()),
        Commands::Version => commands::version::run(),
    }
}
