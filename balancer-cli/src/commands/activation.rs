//! `btrfs-balancer activation`: bus activation and policy files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use balancer_daemon::paths::{activation_file_path, policy_file_path, DEFAULT_BINARY};
use balancer_daemon::{
    generate_activation_file, generate_policy, install_activation, uninstall_activation,
};

#[derive(Subcommand, Debug)]
pub enum ActivationCommand {
    /// Print both files with their install locations.
    Print(ActivationArgs),
    /// Write both files below `--root`.
    Install(ActivationArgs),
    /// Remove both files from below `--root`.
    Uninstall(ActivationArgs),
}

#[derive(Args, Debug)]
pub struct ActivationArgs {
    /// Filesystem root to install into (a staging directory when packaging).
    #[arg(long, default_value = "/")]
    pub root: PathBuf,

    /// Service binary the bus daemon should execute.
    #[arg(long, default_value = DEFAULT_BINARY)]
    pub binary: PathBuf,
}

pub fn run(command: ActivationCommand) -> Result<()> {
    match command {
        ActivationCommand::Print(args) => {
            print_file(
                &activation_file_path(&args.root),
                &generate_activation_file(&args.binary),
            );
            println!();
            print_file(&policy_file_path(&args.root), &generate_policy());
        }
        ActivationCommand::Install(args) => {
            let written = install_activation(&args.root, &args.binary)
                .context("failed to install activation files")?;
            for path in written {
                println!("installed {}", path.display());
            }
        }
        ActivationCommand::Uninstall(args) => {
            uninstall_activation(&args.root).context("failed to remove activation files")?;
            println!("removed activation files");
        }
    }
    Ok(())
}

fn print_file(path: &Path, contents: &str) {
    println!("# {}", path.display());
    print!("{contents}");
}
