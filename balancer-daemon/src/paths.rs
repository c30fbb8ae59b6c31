use std::path::{Path, PathBuf};

use balancer_core::SERVICE_NAME;

/// Where packaging installs the service binary.
pub const DEFAULT_BINARY: &str = "/usr/bin/btrfs-balancer";

/// `<root>/usr/share/dbus-1/system-services`
pub fn system_services_dir(root: &Path) -> PathBuf {
    root.join("usr")
        .join("share")
        .join("dbus-1")
        .join("system-services")
}

/// `<root>/etc/dbus-1/system.d`
pub fn bus_policy_dir(root: &Path) -> PathBuf {
    root.join("etc").join("dbus-1").join("system.d")
}

pub fn activation_file_path(root: &Path) -> PathBuf {
    system_services_dir(root).join(format!("{SERVICE_NAME}.service"))
}

pub fn policy_file_path(root: &Path) -> PathBuf {
    bus_policy_dir(root).join(format!("{SERVICE_NAME}.conf"))
}
