//! Service configuration.
//!
//! # File
//!
//! ```text
//! /etc/btrfs-balancer/config.yaml   (optional, every field has a default)
//! ```
//!
//! A missing file yields [`ServiceConfig::default`]. The idle timeout is not
//! part of the file; see [`crate::types::IDLE_TIMEOUT`].

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/btrfs-balancer/config.yaml";

/// Which message bus the service lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::System => write!(f, "system"),
            BusKind::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bus: BusKind,
    /// Group whose members may invoke privileged operations. Root always may.
    pub privileged_group: String,
    /// Directory holding one control directory per process (`<proc_root>/<pid>`).
    pub proc_root: PathBuf,
    /// Mount point of the btrfs filesystem to manage.
    pub mount_point: PathBuf,
    pub btrfs_binary: PathBuf,
    /// Usage filters, one balance pass each, in order.
    pub balance_passes: Vec<u8>,
    pub power_supply_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::System,
            privileged_group: "privileged".to_string(),
            proc_root: PathBuf::from("/proc"),
            mount_point: PathBuf::from("/"),
            btrfs_binary: PathBuf::from("btrfs"),
            balance_passes: vec![0, 10, 25, 50],
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

impl ServiceConfig {
    /// Load the config at `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid "all defaults" document.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ServiceConfig =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.privileged_group.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "privileged_group",
                reason: "must not be empty".to_string(),
            });
        }
        if self.balance_passes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "balance_passes",
                reason: "at least one pass is required".to_string(),
            });
        }
        if let Some(pass) = self.balance_passes.iter().find(|pass| **pass > 100) {
            return Err(ConfigError::Invalid {
                field: "balance_passes",
                reason: format!("usage filter {pass} is not a percentage"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = ServiceConfig::load(&dir.path().join("absent.yaml")).expect("load");
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "bus: session\nmount_point: /home\n").expect("write");

        let config = ServiceConfig::load(&path).expect("load");
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.mount_point, PathBuf::from("/home"));
        assert_eq!(config.privileged_group, "privileged");
        assert_eq!(config.balance_passes, vec![0, 10, 25, 50]);
    }
}
