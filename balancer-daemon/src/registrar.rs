//! Claiming the well-known bus name and publishing the command object.
//!
//! The dispatcher is constructed only after the name is held, so a losing
//! process never builds a service it cannot expose.

use std::future::Future;
use std::sync::Arc;

use balancer_core::{OBJECT_PATH, SERVICE_NAME};

use crate::dispatcher::CommandDispatcher;
use crate::error::ServiceError;

/// The few bus operations registration needs.
#[allow(async_fn_in_trait)]
pub trait BusTransport {
    /// Claim `name` without queueing. An existing owner is [`ServiceError::NameInUse`].
    async fn request_name(&self, name: &str) -> Result<(), ServiceError>;

    /// Expose `dispatcher` at `path`. An occupied path is [`ServiceError::PublishFailure`].
    async fn publish(
        &self,
        path: &str,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Result<(), ServiceError>;

    async fn release_name(&self, name: &str) -> Result<(), ServiceError>;
}

pub struct ServiceRegistrar<T: BusTransport> {
    transport: T,
    dispatcher: Arc<CommandDispatcher>,
    claimed: bool,
    published: bool,
}

impl<T: BusTransport> ServiceRegistrar<T> {
    /// Connect, claim [`SERVICE_NAME`], then build the dispatcher with `build`
    /// and publish it at [`OBJECT_PATH`].
    ///
    /// A publish failure is not an error: the registrar is returned holding
    /// the name but serving nothing (see [`ServiceRegistrar::is_published`]).
    pub async fn acquire<C, B>(connect: C, build: B) -> Result<Self, ServiceError>
    where
        C: Future<Output = Result<T, ServiceError>>,
        B: FnOnce() -> Arc<CommandDispatcher>,
    {
        tracing::info!(service = SERVICE_NAME, "acquiring bus service");
        let transport = match connect.await {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(error = %err, "could not connect to message bus");
                return Err(match err {
                    ServiceError::TransportUnavailable(_) => err,
                    other => ServiceError::TransportUnavailable(other.to_string()),
                });
            }
        };

        if let Err(err) = transport.request_name(SERVICE_NAME).await {
            tracing::warn!(
                service = SERVICE_NAME,
                error = %err,
                "service name is already in use or not authorized",
            );
            return Err(err);
        }

        let dispatcher = build();
        let published = match transport.publish(OBJECT_PATH, dispatcher.clone()).await {
            Ok(()) => {
                tracing::info!(path = OBJECT_PATH, "service object published");
                true
            }
            Err(err) => {
                tracing::warn!(path = OBJECT_PATH, error = %err, "failed to register service object");
                false
            }
        };

        Ok(Self {
            transport,
            dispatcher,
            claimed: true,
            published,
        })
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the name back. Only the first call after a successful claim talks
    /// to the bus; later calls are no-ops.
    pub async fn release(&mut self) -> Result<(), ServiceError> {
        if !self.claimed {
            return Ok(());
        }
        self.claimed = false;
        self.transport.release_name(SERVICE_NAME).await?;
        tracing::info!(service = SERVICE_NAME, "bus name released");
        Ok(())
    }
}
