//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};

use balancer_core::{EngineEvent, EngineStatus};
use balancer_engine::{AllocationProbe, BatteryProbe, Engine, EngineError, EventSink};

use crate::authorizer::{CredentialAuthorizer, ProcessOwner, ProcessOwnerLookup};
use crate::dispatcher::CommandDispatcher;
use crate::facade::EngineFacade;
use crate::maintenance::MaintenanceProbes;
use crate::watchdog::IdleWatchdog;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineCall {
    CheckStatus,
    CheckAllocation,
    Balance,
}

/// Records calls. Events are pushed by the test via [`FakeEngine::emit`],
/// unless the engine was built to complete balances on its own.
pub(crate) struct FakeEngine {
    sink: EventSink,
    calls: Mutex<Vec<EngineCall>>,
    called: Notify,
    completes_with: Option<bool>,
}

impl FakeEngine {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::build(None)
    }

    pub(crate) fn completing(success: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::build(Some(success))
    }

    fn build(completes_with: Option<bool>) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sink, rx) = EventSink::channel();
        let engine = Arc::new(Self {
            sink,
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
            completes_with,
        });
        (engine, rx)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        assert!(self.sink.emit(event), "engine event pump is gone");
    }

    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) async fn wait_for_call(&self, call: EngineCall) {
        loop {
            let notified = self.called.notified();
            if self.calls().contains(&call) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().expect("calls lock").push(call);
        self.called.notify_waiters();
    }
}

impl Engine for FakeEngine {
    fn check_status(&self) {
        self.record(EngineCall::CheckStatus);
    }

    fn check_allocation(&self) {
        self.record(EngineCall::CheckAllocation);
    }

    fn balance(&self) {
        self.record(EngineCall::Balance);
        if let Some(success) = self.completes_with {
            self.emit(EngineEvent::Status(EngineStatus::Balancing));
            self.emit(EngineEvent::Progress(100));
            self.emit(EngineEvent::Finished(success));
            self.emit(EngineEvent::Status(EngineStatus::Idle));
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

pub(crate) struct FakeProbe(pub u8);

impl AllocationProbe for FakeProbe {
    fn allocation_percent(&self) -> Result<u8, EngineError> {
        Ok(self.0)
    }
}

impl BatteryProbe for FakeProbe {
    fn battery_percent(&self) -> Result<u8, EngineError> {
        Ok(self.0)
    }
}

pub(crate) struct FailingProbe;

impl AllocationProbe for FailingProbe {
    fn allocation_percent(&self) -> Result<u8, EngineError> {
        Err(EngineError::Parse("probe offline".to_string()))
    }
}

impl BatteryProbe for FailingProbe {
    fn battery_percent(&self) -> Result<u8, EngineError> {
        Err(EngineError::Parse("probe offline".to_string()))
    }
}

pub(crate) fn fake_probes(allocation: u8, battery: u8) -> MaintenanceProbes {
    MaintenanceProbes {
        allocation: Arc::new(FakeProbe(allocation)),
        battery: Arc::new(FakeProbe(battery)),
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeOwners {
    owners: HashMap<u32, ProcessOwner>,
}

impl FakeOwners {
    pub(crate) fn with(mut self, pid: u32, uid: u32, group: Option<&str>) -> Self {
        self.owners.insert(
            pid,
            ProcessOwner {
                uid,
                gid: uid,
                group: group.map(str::to_string),
            },
        );
        self
    }
}

impl ProcessOwnerLookup for FakeOwners {
    fn owner_of(&self, pid: u32) -> std::io::Result<ProcessOwner> {
        self.owners.get(&pid).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no process {pid}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Assembled service
// ---------------------------------------------------------------------------

/// Watchdog + fake engine + facade. Must be built inside a tokio runtime.
pub(crate) struct TestService {
    pub engine: Arc<FakeEngine>,
    pub facade: Arc<EngineFacade>,
    pub watchdog: IdleWatchdog,
    pub shutdown: broadcast::Sender<()>,
}

impl TestService {
    pub(crate) fn new() -> Self {
        Self::assemble(FakeEngine::new())
    }

    pub(crate) fn completing(success: bool) -> Self {
        Self::assemble(FakeEngine::completing(success))
    }

    fn assemble((engine, rx): (Arc<FakeEngine>, mpsc::UnboundedReceiver<EngineEvent>)) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        let (watchdog, _) = IdleWatchdog::spawn(Duration::from_secs(30), shutdown.clone());
        let (facade, _) = EngineFacade::spawn(engine.clone(), rx, watchdog.clone());
        Self {
            engine,
            facade,
            watchdog,
            shutdown,
        }
    }

    pub(crate) fn dispatcher(
        &self,
        owners: FakeOwners,
        probes: MaintenanceProbes,
    ) -> CommandDispatcher {
        CommandDispatcher::new(
            self.facade.clone(),
            CredentialAuthorizer::new(Arc::new(owners), "privileged"),
            probes,
        )
    }
}
