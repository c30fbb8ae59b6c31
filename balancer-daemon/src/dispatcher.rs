//! Command surface of the service.
//!
//! There are two ways in. [`CommandDispatcher::local`] is the in-process API
//! and is always trusted. [`CommandDispatcher::remote`] is what the bus
//! adaptor calls: it runs the [`CredentialAuthorizer`] first and only hands
//! out a [`Privileged`] handle to callers that pass. Every privileged
//! operation lives on [`Privileged`], so nothing can reach the engine without
//! going through one of the two doors.

use std::sync::Arc;

use tokio::sync::broadcast;

use balancer_core::{EngineEvent, MaintenanceRequest};

use crate::authorizer::{AuthorizationDenied, BusCaller, CredentialAuthorizer};
use crate::facade::EngineFacade;
use crate::maintenance::{
    MaintenanceProbes, MaintenanceReport, MaintenanceSession, SessionId, SessionRegistry,
};

pub struct CommandDispatcher {
    facade: Arc<EngineFacade>,
    authorizer: CredentialAuthorizer,
    probes: MaintenanceProbes,
    sessions: SessionRegistry,
}

impl CommandDispatcher {
    pub fn new(
        facade: Arc<EngineFacade>,
        authorizer: CredentialAuthorizer,
        probes: MaintenanceProbes,
    ) -> Self {
        Self {
            facade,
            authorizer,
            probes,
            sessions: SessionRegistry::new(),
        }
    }

    /// In-process entry point. Local callers are implicitly trusted.
    pub fn local(&self) -> Privileged<'_> {
        Privileged { dispatcher: self }
    }

    /// Bus entry point. Denied callers get no handle and therefore no effect.
    pub fn remote(&self, caller: &BusCaller) -> Result<Privileged<'_>, AuthorizationDenied> {
        match self.authorizer.authorize(caller) {
            Ok(()) => {
                tracing::debug!(%caller, "caller authorized");
                Ok(Privileged { dispatcher: self })
            }
            Err(denied) => {
                tracing::warn!(%caller, reason = %denied, "privileged call denied");
                Err(denied)
            }
        }
    }

    /// Engine events for signal re-broadcast. Signals reach every listener.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.facade.subscribe()
    }

    pub fn subscribe_maintenance(&self) -> broadcast::Receiver<MaintenanceReport> {
        self.sessions.subscribe()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.active_sessions().await
    }
}

/// Proof that the current call may run privileged operations.
pub struct Privileged<'a> {
    dispatcher: &'a CommandDispatcher,
}

impl Privileged<'_> {
    pub fn check_status(&self) {
        self.dispatcher.facade.check_status();
    }

    pub fn check_allocation(&self) {
        self.dispatcher.facade.check_allocation();
    }

    pub fn balance(&self) {
        self.dispatcher.facade.balance();
    }

    /// Fire-and-forget: returns as soon as the session is running.
    pub async fn maintenance(&self, allocation_threshold: i32, battery_threshold: i32) -> SessionId {
        let session = MaintenanceSession::new(
            MaintenanceRequest::new(allocation_threshold, battery_threshold),
            self.dispatcher.facade.clone(),
            self.dispatcher.probes.clone(),
        );
        self.dispatcher.sessions.launch(session).await
    }
}
