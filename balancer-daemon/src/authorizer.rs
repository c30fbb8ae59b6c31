//! Caller authorization from process credentials.
//!
//! `/proc/<pid>` is owned by the EUID:EGID of the process, so its ownership
//! tells who is calling without any token. A caller is privileged when that
//! directory belongs to the privileged group or to the superuser.
//!
//! Only bus callers ever reach this module. In-process callers use
//! [`crate::CommandDispatcher::local`] and are trusted structurally.

use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::{Gid, Group};
use thiserror::Error;

/// A command that arrived over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusCaller {
    /// Unique bus name of the sender, e.g. `:1.42`.
    pub sender: String,
    /// Resolved process id; `None` when the sender vanished before lookup.
    pub pid: Option<u32>,
}

impl BusCaller {
    pub fn new(sender: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            sender: sender.into(),
            pid,
        }
    }
}

impl fmt::Display for BusCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {pid})", self.sender),
            None => write!(f, "{} (pid unknown)", self.sender),
        }
    }
}

/// Owner of a process control directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwner {
    pub uid: u32,
    pub gid: u32,
    /// Group name, when the gid maps to a known group.
    pub group: Option<String>,
}

/// Rejection carried back to a bus caller as an access-denied reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct AuthorizationDenied {
    pub reason: String,
}

impl AuthorizationDenied {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// pid → owner of its control directory.
pub trait ProcessOwnerLookup: Send + Sync {
    fn owner_of(&self, pid: u32) -> std::io::Result<ProcessOwner>;
}

/// Reads ownership of `<proc_root>/<pid>`.
#[derive(Debug, Clone)]
pub struct ProcFsOwnerLookup {
    proc_root: PathBuf,
}

impl ProcFsOwnerLookup {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessOwnerLookup for ProcFsOwnerLookup {
    fn owner_of(&self, pid: u32) -> std::io::Result<ProcessOwner> {
        let metadata = std::fs::metadata(self.proc_root.join(pid.to_string()))?;
        let gid = metadata.gid();
        let group = match Group::from_gid(Gid::from_raw(gid)) {
            Ok(group) => group.map(|g| g.name),
            Err(errno) => {
                tracing::debug!(gid, error = %errno, "group lookup failed");
                None
            }
        };
        Ok(ProcessOwner {
            uid: metadata.uid(),
            gid,
            group,
        })
    }
}

#[derive(Clone)]
pub struct CredentialAuthorizer {
    lookup: Arc<dyn ProcessOwnerLookup>,
    privileged_group: String,
}

impl CredentialAuthorizer {
    pub fn new(lookup: Arc<dyn ProcessOwnerLookup>, privileged_group: impl Into<String>) -> Self {
        Self {
            lookup,
            privileged_group: privileged_group.into(),
        }
    }

    /// Decide whether a bus caller may run privileged operations.
    ///
    /// Fails closed: an unresolvable pid or an unreadable control directory
    /// is a denial.
    pub fn authorize(&self, caller: &BusCaller) -> Result<(), AuthorizationDenied> {
        let Some(pid) = caller.pid else {
            return Err(AuthorizationDenied::new(format!(
                "Caller {} could not be resolved to a process",
                caller.sender
            )));
        };

        let owner = match self.lookup.owner_of(pid) {
            Ok(owner) => owner,
            Err(err) => {
                tracing::debug!(pid, error = %err, "cannot read process credentials");
                return Err(AuthorizationDenied::new(format!(
                    "PID {pid} could not be resolved to a process"
                )));
            }
        };

        let in_group = owner.group.as_deref() == Some(self.privileged_group.as_str());
        if in_group || owner.uid == 0 {
            return Ok(());
        }
        Err(AuthorizationDenied::new(format!(
            "PID {pid} is not in {} group",
            self.privileged_group
        )))
    }
}

impl fmt::Debug for CredentialAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialAuthorizer")
            .field("privileged_group", &self.privileged_group)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeOwners;
    use rstest::rstest;

    fn authorizer(owners: FakeOwners) -> CredentialAuthorizer {
        CredentialAuthorizer::new(Arc::new(owners), "privileged")
    }

    #[rstest]
    #[case::privileged_group(1000, Some("privileged"), true)]
    #[case::root_user(0, Some("users"), true)]
    #[case::root_without_group_name(0, None, true)]
    #[case::plain_user(1000, Some("users"), false)]
    #[case::unknown_group(1000, None, false)]
    fn ownership_decides(#[case] uid: u32, #[case] group: Option<&str>, #[case] allowed: bool) {
        let owners = FakeOwners::default().with(4321, uid, group);
        let verdict = authorizer(owners).authorize(&BusCaller::new(":1.7", Some(4321)));
        assert_eq!(verdict.is_ok(), allowed, "verdict: {verdict:?}");
    }

    #[test]
    fn denial_reason_embeds_pid() {
        let owners = FakeOwners::default().with(4321, 1000, Some("users"));
        let denied = authorizer(owners)
            .authorize(&BusCaller::new(":1.7", Some(4321)))
            .unwrap_err();
        assert_eq!(denied.reason, "PID 4321 is not in privileged group");
    }

    #[test]
    fn vanished_process_is_denied() {
        let denied = authorizer(FakeOwners::default())
            .authorize(&BusCaller::new(":1.7", Some(99)))
            .unwrap_err();
        assert!(denied.reason.contains("99"), "got: {denied}");
    }

    #[test]
    fn unresolved_pid_is_denied() {
        let owners = FakeOwners::default().with(1, 0, Some("root"));
        let denied = authorizer(owners)
            .authorize(&BusCaller::new(":1.9", None))
            .unwrap_err();
        assert!(denied.reason.contains(":1.9"), "got: {denied}");
    }

    #[test]
    fn proc_lookup_reads_directory_ownership() {
        let root = tempfile::TempDir::new().expect("tempdir");
        std::fs::create_dir(root.path().join("4321")).expect("mkdir pid dir");
        let expected = std::fs::metadata(root.path().join("4321")).expect("metadata");

        let owner = ProcFsOwnerLookup::new(root.path())
            .owner_of(4321)
            .expect("owner");
        assert_eq!(owner.uid, expected.uid());
        assert_eq!(owner.gid, expected.gid());

        let missing = ProcFsOwnerLookup::new(root.path()).owner_of(1234);
        assert!(missing.is_err());
    }
}
