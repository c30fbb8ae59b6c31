//! Boundary wrapper around the balancing engine.
//!
//! Commands are forwarded unconditionally (authorization happened upstream).
//! Engine events are pumped, in emission order, to every subscriber of a
//! broadcast channel. `Status` events also drive the idle watchdog.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use balancer_core::{EngineEvent, EngineStatus};
use balancer_engine::Engine;

use crate::watchdog::IdleWatchdog;

const EVENT_CAPACITY: usize = 256;

pub struct EngineFacade {
    engine: Arc<dyn Engine>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineFacade {
    /// Wrap `engine` and start pumping its events from `engine_events`.
    pub fn spawn(
        engine: Arc<dyn Engine>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        watchdog: IdleWatchdog,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let facade = Arc::new(Self {
            engine,
            events: events.clone(),
        });
        let handle = tokio::spawn(pump_events(engine_events, events, watchdog));
        (facade, handle)
    }

    pub fn check_status(&self) {
        self.engine.check_status();
    }

    pub fn check_allocation(&self) {
        self.engine.check_allocation();
    }

    pub fn balance(&self) {
        self.engine.balance();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

async fn pump_events(
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    events: broadcast::Sender<EngineEvent>,
    watchdog: IdleWatchdog,
) {
    while let Some(event) = engine_events.recv().await {
        if let EngineEvent::Status(status) = event {
            tracing::info!(%status, code = status.code(), "engine status");
            if status == EngineStatus::Balancing {
                watchdog.stop();
            } else {
                watchdog.start();
            }
        }
        // No subscribers is fine: nobody is listening on the bus yet.
        let _ = events.send(event);
    }
    tracing::debug!("engine event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EngineCall, FakeEngine};
    use std::time::Duration;

    fn watchdog() -> IdleWatchdog {
        let (shutdown_tx, _) = broadcast::channel(1);
        IdleWatchdog::spawn(Duration::from_secs(30), shutdown_tx).0
    }

    #[tokio::test]
    async fn commands_are_forwarded() {
        let (engine, rx) = FakeEngine::new();
        let (facade, _pump) = EngineFacade::spawn(engine.clone(), rx, watchdog());

        facade.check_status();
        facade.check_allocation();
        facade.balance();

        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::CheckStatus,
                EngineCall::CheckAllocation,
                EngineCall::Balance
            ]
        );
    }

    #[tokio::test]
    async fn events_are_rebroadcast_in_order() {
        let (engine, rx) = FakeEngine::new();
        let (facade, _pump) = EngineFacade::spawn(engine.clone(), rx, watchdog());
        let mut first = facade.subscribe();
        let mut second = facade.subscribe();

        let emitted = [
            EngineEvent::Status(EngineStatus::Balancing),
            EngineEvent::Allocation {
                used: 10,
                total: 100,
            },
            EngineEvent::Progress(40),
            EngineEvent::Finished(true),
        ];
        for event in emitted {
            engine.emit(event);
        }

        for subscriber in [&mut first, &mut second] {
            for expected in emitted {
                assert_eq!(subscriber.recv().await.expect("event"), expected);
            }
        }
    }

    #[tokio::test]
    async fn status_events_drive_the_watchdog() {
        let (engine, rx) = FakeEngine::new();
        let watchdog = watchdog();
        let (facade, _pump) = EngineFacade::spawn(engine.clone(), rx, watchdog.clone());
        let mut events = facade.subscribe();
        assert!(watchdog.is_running());

        engine.emit(EngineEvent::Status(EngineStatus::Balancing));
        events.recv().await.expect("status");
        assert!(!watchdog.is_running(), "balancing suspends the countdown");

        engine.emit(EngineEvent::Progress(50));
        events.recv().await.expect("progress");
        assert!(!watchdog.is_running(), "progress does not touch the countdown");

        engine.emit(EngineEvent::Status(EngineStatus::Idle));
        events.recv().await.expect("status");
        assert!(watchdog.is_running(), "any other status restarts it");

        engine.emit(EngineEvent::Status(EngineStatus::Unavailable));
        events.recv().await.expect("status");
        assert!(watchdog.is_running());
    }
}
