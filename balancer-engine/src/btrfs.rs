//! Engine backed by the `btrfs` command-line tool.
//!
//! Each operation spawns a task on the current tokio runtime and reports
//! through the [`EventSink`]. A balance runs one
//! `btrfs balance start -dusage=N -musage=N <mount>` per configured pass.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;

use balancer_core::{EngineEvent, EngineStatus, ServiceConfig};

use crate::error::{io_err, EngineError};
use crate::{Engine, EventSink};

pub struct BtrfsEngine {
    inner: Arc<Inner>,
}

struct Inner {
    binary: PathBuf,
    mount_point: PathBuf,
    passes: Vec<u8>,
    sink: EventSink,
    balancing: AtomicBool,
}

impl BtrfsEngine {
    pub fn new(config: &ServiceConfig, sink: EventSink) -> Self {
        Self::with_tool(
            config.btrfs_binary.clone(),
            config.mount_point.clone(),
            config.balance_passes.clone(),
            sink,
        )
    }

    pub fn with_tool(
        binary: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        passes: Vec<u8>,
        sink: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                binary: binary.into(),
                mount_point: mount_point.into(),
                passes,
                sink,
                balancing: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_balancing(&self) -> bool {
        self.inner.balancing.load(Ordering::SeqCst)
    }
}

impl Engine for BtrfsEngine {
    fn check_status(&self) {
        if self.is_balancing() {
            self.inner.sink.emit(EngineEvent::Status(EngineStatus::Balancing));
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let status = inner.query_status().await;
            inner.sink.emit(EngineEvent::Status(status));
        });
    }

    fn check_allocation(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.query_allocation().await {
                Ok((used, total)) => {
                    inner.sink.emit(EngineEvent::Allocation { used, total });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "allocation query failed");
                    inner
                        .sink
                        .emit(EngineEvent::Status(EngineStatus::Unavailable));
                }
            }
        });
    }

    fn balance(&self) {
        if self.inner.balancing.swap(true, Ordering::SeqCst) {
            tracing::info!("balance already running, not starting another");
            self.inner.sink.emit(EngineEvent::Status(EngineStatus::Balancing));
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_balance().await;
        });
    }
}

impl Inner {
    async fn query_status(&self) -> EngineStatus {
        let result = self
            .command(&["balance", "status"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            // `btrfs balance status` exits 1 while a balance is in progress.
            Ok(status) => match status.code() {
                Some(0) => EngineStatus::Idle,
                Some(1) => EngineStatus::Balancing,
                _ => {
                    tracing::warn!(%status, "balance status query failed");
                    EngineStatus::Unavailable
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, binary = %self.binary.display(), "cannot run btrfs tool");
                EngineStatus::Unavailable
            }
        }
    }

    async fn query_allocation(&self) -> Result<(i64, i64), EngineError> {
        let stdout = self.run_checked(&["filesystem", "usage", "-b"]).await?;
        parse_usage(&stdout)
    }

    async fn run_balance(&self) {
        self.sink
            .emit(EngineEvent::Status(EngineStatus::Balancing));

        let total = self.passes.len().max(1);
        let mut success = true;
        for (index, usage) in self.passes.iter().enumerate() {
            let dusage = format!("-dusage={usage}");
            let musage = format!("-musage={usage}");
            match self
                .run_checked(&["balance", "start", dusage.as_str(), musage.as_str()])
                .await
            {
                Ok(_) => {
                    let percent = ((index + 1) * 100 / total) as i32;
                    tracing::debug!(usage, percent, "balance pass completed");
                    self.sink.emit(EngineEvent::Progress(percent));
                }
                Err(err) => {
                    tracing::warn!(usage, error = %err, "balance pass failed");
                    success = false;
                    break;
                }
            }
        }

        self.balancing.store(false, Ordering::SeqCst);
        tracing::info!(success, "balance finished");
        self.sink.emit(EngineEvent::Finished(success));
        self.sink.emit(EngineEvent::Status(EngineStatus::Idle));
    }

    /// `<binary> <args...> <mount_point>`
    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args).arg(&self.mount_point).kill_on_drop(true);
        command
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, EngineError> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| io_err(&self.binary, e))?;

        if !output.status.success() {
            return Err(EngineError::Tool {
                command: describe(&self.binary, args, &self.mount_point),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub(crate) fn describe(binary: &Path, args: &[&str], mount_point: &Path) -> String {
    format!(
        "{} {} {}",
        binary.display(),
        args.join(" "),
        mount_point.display()
    )
}

/// Extract `(allocated, size)` from `btrfs filesystem usage -b` output.
pub fn parse_usage(output: &str) -> Result<(i64, i64), EngineError> {
    let mut size = None;
    let mut allocated = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "Device size" => &mut size,
            "Device allocated" => &mut allocated,
            _ => continue,
        };
        let number = value
            .split_whitespace()
            .next()
            .ok_or_else(|| EngineError::Parse(format!("empty value for '{}'", key.trim())))?;
        let parsed = number
            .parse::<i64>()
            .map_err(|err| EngineError::Parse(format!("'{}' = '{number}': {err}", key.trim())))?;
        *slot = Some(parsed);
    }

    match (allocated, size) {
        (Some(allocated), Some(size)) => Ok((allocated, size)),
        _ => Err(EngineError::Parse(
            "missing 'Device size' or 'Device allocated' in filesystem usage".to_string(),
        )),
    }
}
