//! Domain types shared by the engine, the service and its clients.
//!
//! The bus identity is fixed for the lifetime of the process and is the same
//! on every installation, so it lives here as plain constants.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bus identity
// ---------------------------------------------------------------------------

/// Well-known bus name claimed by the service.
pub const SERVICE_NAME: &str = "org.nemomobile.BtrfsBalancer";

/// Object path the command/event object is published at.
pub const OBJECT_PATH: &str = "/BtrfsBalancer";

/// Interface carrying the privileged methods and the broadcast signals.
pub const INTERFACE_NAME: &str = "org.nemomobile.BtrfsBalancer";

/// Time without engine activity after which the service exits.
pub const IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

// ---------------------------------------------------------------------------
// Engine vocabulary
// ---------------------------------------------------------------------------

/// State reported asynchronously by the balancing engine.
///
/// The numeric codes are part of the bus contract: the `status` signal carries
/// [`EngineStatus::code`] as a plain integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    #[default]
    Idle,
    Balancing,
    /// The engine could not query the filesystem (not btrfs, tool missing, ...).
    Unavailable,
}

impl EngineStatus {
    pub fn code(self) -> i32 {
        match self {
            EngineStatus::Idle => 0,
            EngineStatus::Balancing => 1,
            EngineStatus::Unavailable => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(EngineStatus::Idle),
            1 => Some(EngineStatus::Balancing),
            2 => Some(EngineStatus::Unavailable),
            _ => None,
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Balancing => write!(f, "balancing"),
            EngineStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// One asynchronous event emitted by the engine, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "lowercase")]
pub enum EngineEvent {
    Status(EngineStatus),
    Allocation { used: i64, total: i64 },
    Progress(i32),
    Finished(bool),
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Thresholds for one conditional maintenance run. Both are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub allocation_threshold: i32,
    pub battery_threshold: i32,
}

impl MaintenanceRequest {
    pub fn new(allocation_threshold: i32, battery_threshold: i32) -> Self {
        Self {
            allocation_threshold,
            battery_threshold,
        }
    }

    /// Balancing is worth it only when the filesystem is full enough AND the
    /// battery can afford the pass.
    pub fn should_balance(&self, allocation_percent: u8, battery_percent: u8) -> bool {
        i32::from(allocation_percent) >= self.allocation_threshold
            && i32::from(battery_percent) >= self.battery_threshold
    }
}

impl fmt::Display for MaintenanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation >= {}%, battery >= {}%",
            self.allocation_threshold, self.battery_threshold
        )
    }
}
