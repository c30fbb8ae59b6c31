//! btrfs-balancer: on-demand bus service and its command-line client.
//!
//! # Usage
//!
//! ```text
//! btrfs-balancer [--config PATH] serve
//! btrfs-balancer status [--session] [--json]
//! btrfs-balancer allocation [--session] [--json]
//! btrfs-balancer balance [--session]
//! btrfs-balancer maintenance --allocation N --battery N [--session]
//! btrfs-balancer watch [--session]
//! btrfs-balancer activation print|install|uninstall [--root DIR] [--binary PATH]
//! ```

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use balancer_core::{ServiceConfig, DEFAULT_CONFIG_PATH};
use commands::{
    activation::ActivationCommand,
    client::{BalanceArgs, MaintenanceArgs, QueryArgs, WatchArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "btrfs-balancer",
    version,
    about = "Privileged btrfs balancing service and client",
    long_about = None,
)]
struct Cli {
    /// Service configuration file. Missing means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bus service in the foreground until it goes idle.
    Serve,

    /// Ask the service for the engine status.
    Status(QueryArgs),

    /// Ask the service for the filesystem allocation.
    Allocation(QueryArgs),

    /// Start a balance and follow its progress.
    Balance(BalanceArgs),

    /// Start a conditional maintenance run.
    Maintenance(MaintenanceArgs),

    /// Print every signal the service broadcasts, one JSON object per line.
    Watch(WatchArgs),

    /// Generate or install the bus activation and policy files.
    Activation {
        #[command(subcommand)]
        command: ActivationCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => commands::serve::run(load_config(&cli.config)?),
        Commands::Status(args) => args.status(&load_config(&cli.config)?),
        Commands::Allocation(args) => args.allocation(&load_config(&cli.config)?),
        Commands::Balance(args) => args.run(&load_config(&cli.config)?),
        Commands::Maintenance(args) => args.run(&load_config(&cli.config)?),
        Commands::Watch(args) => args.run(&load_config(&cli.config)?),
        Commands::Activation { command } => commands::activation::run(command),
    }
}

fn load_config(path: &Path) -> Result<ServiceConfig> {
    ServiceConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}
