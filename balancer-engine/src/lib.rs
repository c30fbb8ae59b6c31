//! # balancer-engine
//!
//! The boundary to the storage-maintenance collaborators: the balancing
//! [`Engine`] and the resource probes consulted by maintenance policy.
//!
//! Engines never block their caller. Every result surfaces later as an
//! [`EngineEvent`] pushed through the [`EventSink`] handed to the engine at
//! construction.

pub mod btrfs;
pub mod error;
pub mod probes;

use tokio::sync::mpsc;

use balancer_core::EngineEvent;

pub use btrfs::BtrfsEngine;
pub use error::EngineError;
pub use probes::{AllocationProbe, BatteryProbe, BtrfsAllocationProbe, SysfsBatteryProbe};

/// Operations accepted by a balancing engine.
pub trait Engine: Send + Sync {
    /// Report the current [`balancer_core::EngineStatus`] as a `Status` event.
    fn check_status(&self);

    /// Report used/total bytes as an `Allocation` event.
    fn check_allocation(&self);

    /// Start a balance pass. Progress and the final `Finished` arrive as events.
    fn balance(&self);
}

/// Ordered, unbounded outlet for engine events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once nobody listens any more.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::debug!(?event, "engine event dropped, no listener");
                false
            }
        }
    }
}
