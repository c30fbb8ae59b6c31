//! Resource probes consulted by maintenance policy.
//!
//! Both probes are synchronous, bounded reads returning a percentage
//! between 0 and 100. Callers on a runtime should read them off the
//! async threads.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use std::process::{Command, Stdio};

use balancer_core::ServiceConfig;

use crate::btrfs::{describe, parse_usage};
use crate::error::{io_err, EngineError};

pub trait AllocationProbe: Send + Sync {
    fn allocation_percent(&self) -> Result<u8, EngineError>;
}

pub trait BatteryProbe: Send + Sync {
    fn battery_percent(&self) -> Result<u8, EngineError>;
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Chunk allocation of the btrfs filesystem at `mount_point`, read from
/// `btrfs filesystem usage -b`. Same figures as the engine's `allocation`
/// event, so the maintenance gate and the signal agree.
#[derive(Debug, Clone)]
pub struct BtrfsAllocationProbe {
    binary: PathBuf,
    mount_point: PathBuf,
}

impl BtrfsAllocationProbe {
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_tool(config.btrfs_binary.clone(), config.mount_point.clone())
    }

    pub fn with_tool(binary: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mount_point: mount_point.into(),
        }
    }
}

impl AllocationProbe for BtrfsAllocationProbe {
    fn allocation_percent(&self) -> Result<u8, EngineError> {
        let args = ["filesystem", "usage", "-b"];
        let output = Command::new(&self.binary)
            .args(args)
            .arg(&self.mount_point)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| io_err(&self.binary, e))?;

        if !output.status.success() {
            return Err(EngineError::Tool {
                command: describe(&self.binary, &args, &self.mount_point),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let (allocated, size) = parse_usage(&String::from_utf8_lossy(&output.stdout))?;
        Ok(percent_used(
            u64::try_from(allocated).unwrap_or(0),
            u64::try_from(size).unwrap_or(0),
        ))
    }
}

/// Rounded down, clamped to 100. An empty filesystem of size zero reads as 0.
pub fn percent_used(used: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(used) * 100 / u128::from(total)).min(100);
    percent as u8
}

// ---------------------------------------------------------------------------
// Battery
// ---------------------------------------------------------------------------

/// Reads `<power_supply_dir>/*/capacity` for every supply of type `Battery`.
///
/// The weakest battery wins. A device with no battery is mains powered and
/// reads as 100.
#[derive(Debug, Clone)]
pub struct SysfsBatteryProbe {
    power_supply_dir: PathBuf,
}

impl SysfsBatteryProbe {
    pub fn new(power_supply_dir: impl Into<PathBuf>) -> Self {
        Self {
            power_supply_dir: power_supply_dir.into(),
        }
    }

    fn read_capacity(supply: &Path) -> Result<Option<u8>, EngineError> {
        let kind_path = supply.join("type");
        let kind = match fs::read_to_string(&kind_path) {
            Ok(kind) => kind,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&kind_path, err)),
        };
        if kind.trim() != "Battery" {
            return Ok(None);
        }

        let capacity_path = supply.join("capacity");
        let raw = fs::read_to_string(&capacity_path).map_err(|e| io_err(&capacity_path, e))?;
        let capacity = raw.trim().parse::<u8>().map_err(|err| {
            EngineError::Parse(format!(
                "{}: '{}' is not a percentage: {err}",
                capacity_path.display(),
                raw.trim()
            ))
        })?;
        Ok(Some(capacity.min(100)))
    }
}

impl BatteryProbe for SysfsBatteryProbe {
    fn battery_percent(&self) -> Result<u8, EngineError> {
        let entries = match fs::read_dir(&self.power_supply_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(100),
            Err(err) => return Err(io_err(&self.power_supply_dir, err)),
        };

        let mut weakest: Option<u8> = None;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.power_supply_dir, e))?;
            if let Some(capacity) = Self::read_capacity(&entry.path())? {
                weakest = Some(weakest.map_or(capacity, |w| w.min(capacity)));
            }
        }
        Ok(weakest.unwrap_or(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn supply(root: &Path, name: &str, kind: &str, capacity: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("mkdir supply");
        fs::write(dir.join("type"), format!("{kind}\n")).expect("write type");
        if let Some(capacity) = capacity {
            fs::write(dir.join("capacity"), format!("{capacity}\n")).expect("write capacity");
        }
    }

    #[rstest]
    #[case(0, 100, 0)]
    #[case(85, 100, 85)]
    #[case(2, 3, 66)]
    #[case(10, 0, 0)]
    #[case(120, 100, 100)]
    fn percent_used_rounds_down_and_clamps(
        #[case] used: u64,
        #[case] total: u64,
        #[case] expected: u8,
    ) {
        assert_eq!(percent_used(used, total), expected);
    }

    #[test]
    fn weakest_battery_wins_and_mains_is_ignored() {
        let root = TempDir::new().expect("tempdir");
        supply(root.path(), "AC", "Mains", None);
        supply(root.path(), "BAT0", "Battery", Some("90"));
        supply(root.path(), "BAT1", "Battery", Some("42"));

        let probe = SysfsBatteryProbe::new(root.path());
        assert_eq!(probe.battery_percent().expect("probe"), 42);
    }

    #[test]
    fn no_battery_reads_full() {
        let root = TempDir::new().expect("tempdir");
        supply(root.path(), "AC", "Mains", None);
        assert_eq!(
            SysfsBatteryProbe::new(root.path())
                .battery_percent()
                .expect("probe"),
            100
        );
        assert_eq!(
            SysfsBatteryProbe::new(root.path().join("missing"))
                .battery_percent()
                .expect("probe"),
            100
        );
    }

    #[test]
    fn garbage_capacity_is_a_parse_error() {
        let root = TempDir::new().expect("tempdir");
        supply(root.path(), "battery", "Battery", Some("lots"));

        let err = SysfsBatteryProbe::new(root.path())
            .battery_percent()
            .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)), "got: {err}");
    }

    /// A stand-in `btrfs` that prints a usage report for any arguments.
    fn fake_btrfs(dir: &Path, allocated: u64, size: u64) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("btrfs");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat <<EOF\nOverall:\n    Device size:  {size}\n    Device allocated:  {allocated}\n    Used:  1\nEOF\n"
            ),
        )
        .expect("write fake btrfs");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        script
    }

    #[test]
    fn allocation_follows_allocated_chunks_not_data_usage() {
        let dir = TempDir::new().expect("tempdir");
        let btrfs = fake_btrfs(dir.path(), 95, 100);

        let probe = BtrfsAllocationProbe::with_tool(btrfs, dir.path());
        assert_eq!(probe.allocation_percent().expect("probe"), 95);
    }

    #[test]
    fn failing_tool_is_a_tool_error() {
        let err = BtrfsAllocationProbe::with_tool("false", "/")
            .allocation_percent()
            .unwrap_err();
        assert!(matches!(err, EngineError::Tool { .. }), "got: {err}");
    }

    #[test]
    fn missing_tool_is_an_io_error() {
        let err = BtrfsAllocationProbe::with_tool("/nonexistent/btrfs", "/")
            .allocation_percent()
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }), "got: {err}");
    }
}
