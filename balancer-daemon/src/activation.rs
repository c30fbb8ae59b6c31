//! D-Bus activation and bus policy files.
//!
//! The bus daemon starts the service on the first call to its name and the
//! idle watchdog stops it again, so these two files are all the wiring the
//! service needs.

use std::fs;
use std::path::{Path, PathBuf};

use balancer_core::{INTERFACE_NAME, SERVICE_NAME};

use crate::error::{io_err, ServiceError};
use crate::paths::{activation_file_path, policy_file_path};

/// System bus activation file: run `<binary> serve` as root on demand.
pub fn generate_activation_file(binary_path: &Path) -> String {
    format!(
        "[D-BUS Service]\nName={name}\nExec={binary} serve\nUser=root\n",
        name = SERVICE_NAME,
        binary = binary_path.display()
    )
}

/// Bus policy: only root may own the name; anyone may call in, because the
/// service authorizes every privileged call itself.
pub fn generate_policy() -> String {
    format!(
        r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-BUS Bus Configuration 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
<busconfig>
  <policy user="root">
    <allow own="{service}"/>
  </policy>
  <policy context="default">
    <allow send_destination="{service}" send_interface="{interface}"/>
    <allow send_destination="{service}" send_interface="org.freedesktop.DBus.Introspectable"/>
  </policy>
</busconfig>
"#,
        service = SERVICE_NAME,
        interface = INTERFACE_NAME
    )
}

/// Write both files below `root` (`/` for a live system, a staging dir for packaging).
pub fn install(root: &Path, binary_path: &Path) -> Result<Vec<PathBuf>, ServiceError> {
    let activation = activation_file_path(root);
    let policy = policy_file_path(root);

    write_file(&activation, &generate_activation_file(binary_path))?;
    write_file(&policy, &generate_policy())?;
    tracing::info!(
        activation = %activation.display(),
        policy = %policy.display(),
        "installed bus activation files",
    );
    Ok(vec![activation, policy])
}

/// Remove both files. Missing files are fine.
pub fn uninstall(root: &Path) -> Result<(), ServiceError> {
    for path in [activation_file_path(root), policy_file_path(root)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path, err)),
        }
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<(), ServiceError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    fs::write(path, contents).map_err(|e| io_err(path, e))
}
