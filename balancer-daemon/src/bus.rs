//! zbus binding: the published interface, its signals, and the transport
//! used by the registrar.

use std::sync::Arc;

use tokio::sync::broadcast;
use zbus::fdo::{self, RequestNameFlags, RequestNameReply};
use zbus::message::Header;
use zbus::{interface, Connection, SignalContext};

use balancer_core::{BusKind, EngineEvent};

use crate::authorizer::{AuthorizationDenied, BusCaller};
use crate::dispatcher::{CommandDispatcher, Privileged};
use crate::error::ServiceError;
use crate::registrar::BusTransport;

/// The object exposed at [`balancer_core::OBJECT_PATH`].
pub struct BusAdaptor {
    dispatcher: Arc<CommandDispatcher>,
}

impl BusAdaptor {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Authorize the sender of the current call. A denial becomes an
    /// `AccessDenied` error reply carrying the reason.
    async fn privileged(
        &self,
        header: &Header<'_>,
        connection: &Connection,
    ) -> fdo::Result<Privileged<'_>> {
        let caller = resolve_caller(header, connection).await;
        self.dispatcher.remote(&caller).map_err(access_denied)
    }
}

/// The error reply a denied caller receives.
fn access_denied(denied: AuthorizationDenied) -> fdo::Error {
    fdo::Error::AccessDenied(denied.reason)
}

#[interface(name = "org.nemomobile.BtrfsBalancer")]
impl BusAdaptor {
    #[zbus(name = "checkStatus")]
    async fn check_status(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.privileged(&header, connection).await?.check_status();
        Ok(())
    }

    #[zbus(name = "checkAllocation")]
    async fn check_allocation(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.privileged(&header, connection)
            .await?
            .check_allocation();
        Ok(())
    }

    #[zbus(name = "balance")]
    async fn balance(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.privileged(&header, connection).await?.balance();
        Ok(())
    }

    #[zbus(name = "maintenance")]
    async fn maintenance(
        &self,
        allocation_threshold: i32,
        battery_threshold: i32,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> fdo::Result<()> {
        self.privileged(&header, connection)
            .await?
            .maintenance(allocation_threshold, battery_threshold)
            .await;
        Ok(())
    }

    #[zbus(signal, name = "status")]
    async fn status(ctxt: &SignalContext<'_>, code: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "allocation")]
    async fn allocation(ctxt: &SignalContext<'_>, used: i64, total: i64) -> zbus::Result<()>;

    #[zbus(signal, name = "progress")]
    async fn progress(ctxt: &SignalContext<'_>, percent: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "finished")]
    async fn finished(ctxt: &SignalContext<'_>, success: bool) -> zbus::Result<()>;
}

/// Sender name plus its pid as reported by the bus daemon.
async fn resolve_caller(header: &Header<'_>, connection: &Connection) -> BusCaller {
    let Some(sender) = header.sender() else {
        return BusCaller::new("<unknown>", None);
    };
    let pid = match fdo::DBusProxy::new(connection).await {
        Ok(proxy) => match proxy
            .get_connection_unix_process_id(sender.clone().into())
            .await
        {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::debug!(%sender, error = %err, "caller pid lookup failed");
                None
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "cannot reach bus daemon for pid lookup");
            None
        }
    };
    BusCaller::new(sender.to_string(), pid)
}

/// Re-emit every engine event as the matching signal, in order.
pub async fn forward_events(connection: Connection, mut events: broadcast::Receiver<EngineEvent>) {
    let ctxt = match SignalContext::new(&connection, balancer_core::OBJECT_PATH) {
        Ok(ctxt) => ctxt,
        Err(err) => {
            tracing::error!(error = %err, "invalid object path for signals");
            return;
        }
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal forwarding lagged behind engine events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let emitted = match event {
            EngineEvent::Status(status) => BusAdaptor::status(&ctxt, status.code()).await,
            EngineEvent::Allocation { used, total } => {
                BusAdaptor::allocation(&ctxt, used, total).await
            }
            EngineEvent::Progress(percent) => BusAdaptor::progress(&ctxt, percent).await,
            EngineEvent::Finished(success) => BusAdaptor::finished(&ctxt, success).await,
        };
        if let Err(err) = emitted {
            tracing::warn!(?event, error = %err, "failed to emit signal");
        }
    }
}

pub async fn connect(kind: BusKind) -> Result<Connection, ServiceError> {
    let connection = match kind {
        BusKind::System => Connection::system().await,
        BusKind::Session => Connection::session().await,
    };
    connection.map_err(|err| ServiceError::TransportUnavailable(format!("{kind} bus: {err}")))
}

/// [`BusTransport`] over a live zbus connection.
pub struct ZbusTransport {
    connection: Connection,
}

impl ZbusTransport {
    pub async fn connect(kind: BusKind) -> Result<Self, ServiceError> {
        Ok(Self {
            connection: connect(kind).await?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl BusTransport for ZbusTransport {
    async fn request_name(&self, name: &str) -> Result<(), ServiceError> {
        let reply = self
            .connection
            .request_name_with_flags(name, RequestNameFlags::DoNotQueue.into())
            .await;
        match reply {
            Ok(RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner) => Ok(()),
            Ok(RequestNameReply::InQueue | RequestNameReply::Exists) | Err(zbus::Error::NameTaken) => {
                Err(ServiceError::NameInUse {
                    name: name.to_string(),
                })
            }
            Err(err) => Err(ServiceError::Bus(err)),
        }
    }

    async fn publish(
        &self,
        path: &str,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Result<(), ServiceError> {
        let events = dispatcher.subscribe();
        let added = self
            .connection
            .object_server()
            .at(path, BusAdaptor::new(dispatcher))
            .await?;
        if !added {
            return Err(ServiceError::PublishFailure {
                path: path.to_string(),
            });
        }
        tokio::spawn(forward_events(self.connection.clone(), events));
        Ok(())
    }

    async fn release_name(&self, name: &str) -> Result<(), ServiceError> {
        self.connection.release_name(name).await?;
        Ok(())
    }
}
