//! Client commands: talk to a running (or bus-activated) service.

use std::future::Future;
use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use balancer_core::{BusKind, EngineStatus, ServiceConfig};
use balancer_daemon::{client, ServiceError};

/// Bus selection shared by every client command.
#[derive(Args, Debug)]
pub struct BusArgs {
    /// Talk to the session bus instead of the configured one.
    #[arg(long)]
    pub session: bool,
}

impl BusArgs {
    fn kind(&self, config: &ServiceConfig) -> BusKind {
        if self.session {
            BusKind::Session
        } else {
            config.bus
        }
    }
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub bus: BusArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct BalanceArgs {
    #[command(flatten)]
    pub bus: BusArgs,
}

#[derive(Args, Debug)]
pub struct MaintenanceArgs {
    #[command(flatten)]
    pub bus: BusArgs,

    /// Balance only when allocation is at least this percentage.
    #[arg(long)]
    pub allocation: i32,

    /// Balance only when the battery is at least this percentage.
    #[arg(long)]
    pub battery: i32,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub bus: BusArgs,
}

#[derive(Serialize)]
struct AllocationReport {
    used: i64,
    total: i64,
    percent: f64,
}

impl AllocationReport {
    fn new(used: i64, total: i64) -> Self {
        let percent = if total > 0 {
            used as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        Self {
            used,
            total,
            percent,
        }
    }
}

impl QueryArgs {
    pub fn status(self, config: &ServiceConfig) -> Result<()> {
        let status = block_on(client::request_status(self.bus.kind(config)))
            .context("failed to query engine status")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "status": status }))
                    .context("failed to render status JSON")?
            );
            return Ok(());
        }
        println!("engine status: {}", paint(status));
        Ok(())
    }

    pub fn allocation(self, config: &ServiceConfig) -> Result<()> {
        let (used, total) = block_on(client::request_allocation(self.bus.kind(config)))
            .context("failed to query allocation")?;
        let report = AllocationReport::new(used, total);
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render allocation JSON")?
            );
            return Ok(());
        }
        println!(
            "allocated {} of {} bytes ({:.1}%)",
            report.used, report.total, report.percent
        );
        Ok(())
    }
}

impl BalanceArgs {
    pub fn run(self, config: &ServiceConfig) -> Result<()> {
        let success = block_on(client::request_balance(self.bus.kind(config), |percent| {
            println!("progress: {percent}%");
        }))
        .context("balance failed")?;

        if success {
            println!("{}", "balance finished".green().bold());
            Ok(())
        } else {
            anyhow::bail!("engine reported an unsuccessful balance")
        }
    }
}

impl MaintenanceArgs {
    pub fn run(self, config: &ServiceConfig) -> Result<()> {
        block_on(client::request_maintenance(
            self.bus.kind(config),
            self.allocation,
            self.battery,
        ))
        .context("failed to start maintenance")?;
        println!(
            "maintenance requested (allocation >= {}%, battery >= {}%)",
            self.allocation, self.battery
        );
        Ok(())
    }
}

impl WatchArgs {
    pub fn run(self, config: &ServiceConfig) -> Result<()> {
        let stdout = std::io::stdout();
        block_on(client::watch_events(self.bus.kind(config), |event| {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{line}");
                    let _ = out.flush();
                }
                Err(err) => eprintln!("unprintable event {event:?}: {err}"),
            }
        }))
        .context("event stream failed")
    }
}

fn paint(status: EngineStatus) -> String {
    match status {
        EngineStatus::Idle => status.to_string().green().bold().to_string(),
        EngineStatus::Balancing => status.to_string().yellow().bold().to_string(),
        EngineStatus::Unavailable => status.to_string().red().bold().to_string(),
    }
}

/// Client calls are async; the CLI itself is not.
fn block_on<T>(future: impl Future<Output = Result<T, ServiceError>>) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future)?)
}
