//! The btrfs balancer bus service.
//!
//! [`run`] claims `org.nemomobile.BtrfsBalancer`, publishes the command
//! object and exits once the [`IdleWatchdog`] fires. The [`client`] module
//! is the other side of the same contract.

pub mod activation;
pub mod authorizer;
pub mod bus;
pub mod client;
pub mod dispatcher;
mod error;
pub mod facade;
pub mod maintenance;
pub mod paths;
pub mod registrar;
mod runtime;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use activation::{
    generate_activation_file, generate_policy, install as install_activation,
    uninstall as uninstall_activation,
};
pub use authorizer::{AuthorizationDenied, BusCaller, CredentialAuthorizer, ProcFsOwnerLookup};
pub use dispatcher::{CommandDispatcher, Privileged};
pub use error::ServiceError;
pub use facade::EngineFacade;
pub use maintenance::{MaintenanceOutcome, MaintenanceReport, MaintenanceSession, SessionId};
pub use registrar::{BusTransport, ServiceRegistrar};
pub use runtime::{run, start_blocking};
pub use watchdog::{IdleWatchdog, WatchdogState};
