//! Client side of the bus contract, used by the CLI.
//!
//! Operations have no return values on the bus; every helper here subscribes
//! to the relevant signal first, then issues the call, then waits.

use std::time::Duration;

use futures::{Stream, StreamExt};
use zbus::proxy;

use balancer_core::{BusKind, EngineEvent, EngineStatus};

use crate::authorizer::AuthorizationDenied;
use crate::bus;
use crate::error::ServiceError;

/// How long to wait for the signal answering a status or allocation query.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";

#[proxy(
    interface = "org.nemomobile.BtrfsBalancer",
    default_service = "org.nemomobile.BtrfsBalancer",
    default_path = "/BtrfsBalancer",
    gen_blocking = false
)]
pub trait Balancer {
    #[zbus(name = "checkStatus")]
    fn check_status(&self) -> zbus::Result<()>;

    #[zbus(name = "checkAllocation")]
    fn check_allocation(&self) -> zbus::Result<()>;

    #[zbus(name = "balance")]
    fn balance(&self) -> zbus::Result<()>;

    #[zbus(name = "maintenance")]
    fn maintenance(&self, allocation_threshold: i32, battery_threshold: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "status")]
    fn status(&self, code: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "allocation")]
    fn allocation(&self, used: i64, total: i64) -> zbus::Result<()>;

    #[zbus(signal, name = "progress")]
    fn progress(&self, percent: i32) -> zbus::Result<()>;

    #[zbus(signal, name = "finished")]
    fn finished(&self, success: bool) -> zbus::Result<()>;
}

pub async fn connect_proxy(kind: BusKind) -> Result<BalancerProxy<'static>, ServiceError> {
    let connection = bus::connect(kind).await?;
    Ok(BalancerProxy::new(&connection).await?)
}

/// Map an error reply to [`ServiceError`], surfacing denials as such.
fn call_error(err: zbus::Error) -> ServiceError {
    match err {
        zbus::Error::MethodError(name, detail, reply) => {
            match denial(name.as_str(), detail.clone()) {
                Some(denied) => ServiceError::AuthorizationDenied(denied),
                None => ServiceError::Bus(zbus::Error::MethodError(name, detail, reply)),
            }
        }
        other => ServiceError::Bus(other),
    }
}

pub(crate) fn denial(error_name: &str, detail: Option<String>) -> Option<AuthorizationDenied> {
    (error_name == ACCESS_DENIED).then(|| AuthorizationDenied {
        reason: detail.unwrap_or_else(|| "access denied".to_string()),
    })
}

pub async fn request_status(kind: BusKind) -> Result<EngineStatus, ServiceError> {
    let proxy = connect_proxy(kind).await?;
    let mut status_signals = proxy.receive_status().await?;
    proxy.check_status().await.map_err(call_error)?;

    let signal = tokio::time::timeout(REPLY_TIMEOUT, status_signals.next())
        .await
        .map_err(|_| ServiceError::Timeout("status signal"))?
        .ok_or(ServiceError::ChannelClosed("status signal stream"))?;
    let code = *signal.args()?.code();
    EngineStatus::from_code(code)
        .ok_or_else(|| ServiceError::Runtime(format!("unknown engine status code {code}")))
}

/// `(used, total)` in bytes.
pub async fn request_allocation(kind: BusKind) -> Result<(i64, i64), ServiceError> {
    let proxy = connect_proxy(kind).await?;
    let mut allocation_signals = proxy
        .receive_allocation()
        .await?
        .map(|signal| {
            let args = signal.args()?;
            Ok::<_, zbus::Error>((*args.used(), *args.total()))
        });
    let mut status_signals = proxy
        .receive_status()
        .await?
        .map(|signal| {
            let args = signal.args()?;
            Ok::<_, zbus::Error>(*args.code())
        });
    proxy.check_allocation().await.map_err(call_error)?;

    tokio::time::timeout(
        REPLY_TIMEOUT,
        first_allocation(&mut allocation_signals, &mut status_signals),
    )
    .await
    .map_err(|_| ServiceError::Timeout("allocation signal"))?
}

/// The engine answers an allocation query with either an allocation or, when
/// it cannot read the filesystem, a status.
async fn first_allocation<A, S>(
    allocation_signals: &mut A,
    status_signals: &mut S,
) -> Result<(i64, i64), ServiceError>
where
    A: Stream<Item = zbus::Result<(i64, i64)>> + Unpin,
    S: Stream<Item = zbus::Result<i32>> + Unpin,
{
    tokio::select! {
        Some(reading) = allocation_signals.next() => Ok(reading?),
        Some(code) = status_signals.next() => {
            let code = code?;
            Err(ServiceError::Runtime(format!(
                "engine answered with status {code} instead of an allocation"
            )))
        }
        else => Err(ServiceError::ChannelClosed("allocation signal stream")),
    }
}

/// Start a balance and follow it to completion. Returns the engine's verdict.
pub async fn request_balance(
    kind: BusKind,
    mut on_progress: impl FnMut(i32),
) -> Result<bool, ServiceError> {
    let proxy = connect_proxy(kind).await?;
    let mut progress_signals = proxy.receive_progress().await?;
    let mut finished_signals = proxy.receive_finished().await?;
    proxy.balance().await.map_err(call_error)?;

    loop {
        tokio::select! {
            Some(signal) = progress_signals.next() => on_progress(*signal.args()?.percent()),
            Some(signal) = finished_signals.next() => return Ok(*signal.args()?.success()),
            else => return Err(ServiceError::ChannelClosed("balance signal stream")),
        }
    }
}

pub async fn request_maintenance(
    kind: BusKind,
    allocation_threshold: i32,
    battery_threshold: i32,
) -> Result<(), ServiceError> {
    let proxy = connect_proxy(kind).await?;
    proxy
        .maintenance(allocation_threshold, battery_threshold)
        .await
        .map_err(call_error)
}

/// Print-agnostic event tap: hands every broadcast signal to `on_event`
/// until the service goes away.
pub async fn watch_events(
    kind: BusKind,
    mut on_event: impl FnMut(EngineEvent),
) -> Result<(), ServiceError> {
    let proxy = connect_proxy(kind).await?;
    let mut status_signals = proxy.receive_status().await?;
    let mut allocation_signals = proxy.receive_allocation().await?;
    let mut progress_signals = proxy.receive_progress().await?;
    let mut finished_signals = proxy.receive_finished().await?;

    loop {
        let event = tokio::select! {
            Some(signal) = status_signals.next() => {
                let code = *signal.args()?.code();
                match EngineStatus::from_code(code) {
                    Some(engine_status) => EngineEvent::Status(engine_status),
                    None => {
                        tracing::warn!(code, "ignoring unknown engine status code");
                        continue;
                    }
                }
            }
            Some(signal) = allocation_signals.next() => {
                let args = signal.args()?;
                EngineEvent::Allocation { used: *args.used(), total: *args.total() }
            }
            Some(signal) = progress_signals.next() => EngineEvent::Progress(*signal.args()?.percent()),
            Some(signal) = finished_signals.next() => EngineEvent::Finished(*signal.args()?.success()),
            else => return Ok(()),
        };
        on_event(event);
    }
}
