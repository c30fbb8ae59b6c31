//! Idle countdown that shuts the service down.
//!
//! The armed deadline lives in a `watch` channel; a single task sleeps until
//! the current deadline and re-reads the channel whenever it changes, so
//! re-arming never leaves an older countdown pending.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Running { deadline: Instant },
    Stopped,
    /// The countdown elapsed and shutdown was requested. Terminal.
    Fired,
}

#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    timeout: Duration,
    state: watch::Sender<WatchdogState>,
}

impl IdleWatchdog {
    /// Create the watchdog already running with a full deadline: a freshly
    /// started service is idle.
    ///
    /// When the countdown elapses, `()` is sent on `shutdown`.
    pub fn spawn(timeout: Duration, shutdown: broadcast::Sender<()>) -> (Self, JoinHandle<()>) {
        let (state, rx) = watch::channel(WatchdogState::Running {
            deadline: Instant::now() + timeout,
        });
        let watchdog = Self { timeout, state };
        let handle = tokio::spawn(countdown_task(watchdog.state.clone(), rx, shutdown));
        (watchdog, handle)
    }

    /// (Re)arm the countdown with a full timeout.
    pub fn start(&self) {
        let deadline = Instant::now() + self.timeout;
        self.state.send_if_modified(|state| {
            if *state == WatchdogState::Fired {
                return false;
            }
            tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "idle timer armed");
            *state = WatchdogState::Running { deadline };
            true
        });
    }

    pub fn stop(&self) {
        self.state.send_if_modified(|state| match state {
            WatchdogState::Running { .. } => {
                tracing::debug!("idle timer stopped");
                *state = WatchdogState::Stopped;
                true
            }
            WatchdogState::Stopped | WatchdogState::Fired => false,
        });
    }

    pub fn state(&self) -> WatchdogState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), WatchdogState::Running { .. })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn countdown_task(
    state: watch::Sender<WatchdogState>,
    mut rx: watch::Receiver<WatchdogState>,
    shutdown: broadcast::Sender<()>,
) {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            WatchdogState::Running { deadline } => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if !fire_if_due(&state, deadline) {
                            // Stopped or re-armed in the same tick.
                            continue;
                        }
                        tracing::info!(service = balancer_core::SERVICE_NAME, "idle timeout reached, shutting down service");
                        let _ = shutdown.send(());
                        return;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            WatchdogState::Stopped => {
                if rx.changed().await.is_err() {
                    return;
                }
            }
            WatchdogState::Fired => return,
        }
    }
}

/// Move to `Fired` only if the countdown that elapsed is still the armed one.
fn fire_if_due(state: &watch::Sender<WatchdogState>, deadline: Instant) -> bool {
    state.send_if_modified(|current| match *current {
        WatchdogState::Running { deadline: armed } if armed == deadline => {
            *current = WatchdogState::Fired;
            true
        }
        _ => false,
    })
}
