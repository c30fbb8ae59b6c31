//! `btrfs-balancer serve`: the process the bus daemon activates.

use anyhow::{Context, Result};

use balancer_core::ServiceConfig;

pub fn run(config: ServiceConfig) -> Result<()> {
    balancer_daemon::start_blocking(config).context("service exited with error")
}
