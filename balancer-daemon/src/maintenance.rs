//! Conditional maintenance runs.
//!
//! A [`MaintenanceSession`] reads the allocation and battery probes once and
//! balances only when both clear their thresholds. Sessions are launched
//! through a [`SessionRegistry`], which owns each running task under a
//! [`SessionId`] and drops it when the session reports completion.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use balancer_core::{EngineEvent, EngineStatus, MaintenanceRequest};
use balancer_engine::{AllocationProbe, BatteryProbe, EngineError};

use crate::facade::EngineFacade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "maintenance-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// The balance ran; `success` is the engine's own verdict.
    Balanced { success: bool },
    Skipped { allocation: u8, battery: u8 },
    /// A probe could not be read; balancing was not attempted.
    ProbeFailed,
}

/// Completion notice for one session. Sent exactly once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub id: SessionId,
    pub outcome: MaintenanceOutcome,
}

#[derive(Clone)]
pub struct MaintenanceProbes {
    pub allocation: Arc<dyn AllocationProbe>,
    pub battery: Arc<dyn BatteryProbe>,
}

pub struct MaintenanceSession {
    request: MaintenanceRequest,
    facade: Arc<EngineFacade>,
    probes: MaintenanceProbes,
}

impl MaintenanceSession {
    pub fn new(
        request: MaintenanceRequest,
        facade: Arc<EngineFacade>,
        probes: MaintenanceProbes,
    ) -> Self {
        Self {
            request,
            facade,
            probes,
        }
    }

    /// Run to completion. Consumes the session.
    pub async fn run(self) -> MaintenanceOutcome {
        let Some((allocation, battery)) = read_probes(self.probes.clone()).await else {
            return MaintenanceOutcome::ProbeFailed;
        };

        if !self.request.should_balance(allocation, battery) {
            tracing::info!(
                allocation,
                battery,
                request = %self.request,
                "maintenance thresholds not met, skipping balance",
            );
            return MaintenanceOutcome::Skipped {
                allocation,
                battery,
            };
        }

        tracing::info!(
            allocation,
            battery,
            request = %self.request,
            "maintenance thresholds met, balancing",
        );
        // Subscribe before starting so the engine's `Finished` cannot be missed.
        let mut events = self.facade.subscribe();
        self.facade.balance();
        let success = wait_for_finished(&mut events).await;
        MaintenanceOutcome::Balanced { success }
    }
}

/// Both readings, taken on the blocking pool since the allocation probe
/// shells out. `None` when either probe fails.
async fn read_probes(probes: MaintenanceProbes) -> Option<(u8, u8)> {
    let readings = tokio::task::spawn_blocking(move || {
        let allocation = probes
            .allocation
            .allocation_percent()
            .map_err(|err| ("allocation", err))?;
        let battery = probes
            .battery
            .battery_percent()
            .map_err(|err| ("battery", err))?;
        Ok::<_, (&'static str, EngineError)>((allocation, battery))
    })
    .await;

    match readings {
        Ok(Ok(readings)) => Some(readings),
        Ok(Err((probe, err))) => {
            tracing::warn!(probe, error = %err, "maintenance probe failed, skipping balance");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "maintenance probe task failed, skipping balance");
            None
        }
    }
}

/// A `Finished` only counts once this subscription has seen the engine report
/// `Balancing`. Anything earlier belongs to a balance that ended before ours.
async fn wait_for_finished(events: &mut broadcast::Receiver<EngineEvent>) -> bool {
    let mut balancing_seen = false;
    loop {
        match events.recv().await {
            Ok(EngineEvent::Status(EngineStatus::Balancing)) => balancing_seen = true,
            Ok(EngineEvent::Finished(success)) if balancing_seen => return success,
            Ok(EngineEvent::Finished(stale)) => {
                tracing::debug!(success = stale, "ignoring completion of an earlier balance");
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "maintenance session lagged behind engine events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!("engine event stream closed before balance finished");
                return false;
            }
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    reports: broadcast::Sender<MaintenanceReport>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                reports,
            }),
        }
    }

    /// Start `session` in the background and return its id immediately.
    pub async fn launch(&self, session: MaintenanceSession) -> SessionId {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::info!(session = %id, request = %session.request, "maintenance started");

        // Held across the spawn so the task cannot deregister before it is registered.
        let mut sessions = self.inner.sessions.lock().await;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = session.run().await;
            inner.sessions.lock().await.remove(&id);
            tracing::info!(session = %id, ?outcome, "maintenance finished");
            let _ = inner.reports.send(MaintenanceReport { id, outcome });
        });
        sessions.insert(id, handle);
        id
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MaintenanceReport> {
        self.inner.reports.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        fake_probes, EngineCall, FakeEngine, FakeProbe, FailingProbe, TestService,
    };
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn thresholds_met_balances_and_follows_engine_completion() {
        let service = TestService::new();
        let probes = fake_probes(85, 90);
        let session =
            MaintenanceSession::new(MaintenanceRequest::new(80, 50), service.facade.clone(), probes);

        let run = tokio::spawn(session.run());
        service.engine.wait_for_call(EngineCall::Balance).await;
        assert!(!run.is_finished(), "session waits for the engine");

        service.engine.emit(EngineEvent::Status(EngineStatus::Balancing));
        service.engine.emit(EngineEvent::Progress(50));
        service.engine.emit(EngineEvent::Finished(true));

        let outcome = run.await.expect("session task");
        assert_eq!(outcome, MaintenanceOutcome::Balanced { success: true });
        assert_eq!(service.engine.calls(), vec![EngineCall::Balance]);
    }

    #[tokio::test]
    async fn completion_of_an_earlier_balance_is_not_ours() {
        let service = TestService::new();
        let session = MaintenanceSession::new(
            MaintenanceRequest::new(80, 50),
            service.facade.clone(),
            fake_probes(85, 90),
        );

        let run = tokio::spawn(session.run());
        service.engine.wait_for_call(EngineCall::Balance).await;
        // Still queued from a balance that ended before this session asked.
        service.engine.emit(EngineEvent::Finished(false));
        service.engine.emit(EngineEvent::Status(EngineStatus::Idle));
        tokio::task::yield_now().await;
        assert!(!run.is_finished(), "stale completion must be ignored");

        service.engine.emit(EngineEvent::Status(EngineStatus::Balancing));
        service.engine.emit(EngineEvent::Finished(true));

        let outcome = run.await.expect("session task");
        assert_eq!(outcome, MaintenanceOutcome::Balanced { success: true });
        assert_eq!(service.engine.calls(), vec![EngineCall::Balance]);
    }

    #[tokio::test]
    async fn low_allocation_skips_balance() {
        let service = TestService::new();
        let session = MaintenanceSession::new(
            MaintenanceRequest::new(80, 50),
            service.facade.clone(),
            fake_probes(60, 90),
        );

        let outcome = session.run().await;
        assert_eq!(
            outcome,
            MaintenanceOutcome::Skipped {
                allocation: 60,
                battery: 90
            }
        );
        assert!(service.engine.calls().is_empty(), "balance never invoked");
    }

    #[tokio::test]
    async fn low_battery_skips_balance() {
        let service = TestService::new();
        let session = MaintenanceSession::new(
            MaintenanceRequest::new(80, 50),
            service.facade.clone(),
            fake_probes(95, 30),
        );

        assert!(matches!(
            session.run().await,
            MaintenanceOutcome::Skipped { .. }
        ));
        assert!(service.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn probe_failure_skips_balance() {
        let service = TestService::new();
        let probes = MaintenanceProbes {
            allocation: Arc::new(FailingProbe),
            battery: Arc::new(FakeProbe(100)),
        };
        let session =
            MaintenanceSession::new(MaintenanceRequest::new(0, 0), service.facade.clone(), probes);

        assert_eq!(session.run().await, MaintenanceOutcome::ProbeFailed);
        assert!(service.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn registry_reports_once_and_releases_the_session() {
        let service = TestService::completing(true);
        let registry = SessionRegistry::new();
        let mut reports = registry.subscribe();

        let balanced = registry
            .launch(MaintenanceSession::new(
                MaintenanceRequest::new(80, 50),
                service.facade.clone(),
                fake_probes(85, 90),
            ))
            .await;
        let skipped = registry
            .launch(MaintenanceSession::new(
                MaintenanceRequest::new(80, 50),
                service.facade.clone(),
                fake_probes(60, 90),
            ))
            .await;
        assert_ne!(balanced, skipped, "every session gets its own id");

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(reports.recv().await.expect("report"));
        }
        seen.sort_by_key(|report| report.id);

        assert_eq!(
            seen,
            vec![
                MaintenanceReport {
                    id: balanced,
                    outcome: MaintenanceOutcome::Balanced { success: true }
                },
                MaintenanceReport {
                    id: skipped,
                    outcome: MaintenanceOutcome::Skipped {
                        allocation: 60,
                        battery: 90
                    }
                },
            ]
        );
        assert!(matches!(reports.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(registry.active_sessions().await, 0);
    }
}
