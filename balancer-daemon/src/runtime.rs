use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

use balancer_core::{ServiceConfig, IDLE_TIMEOUT};
use balancer_engine::{BtrfsAllocationProbe, BtrfsEngine, EventSink, SysfsBatteryProbe};

use crate::authorizer::{CredentialAuthorizer, ProcFsOwnerLookup};
use crate::bus::ZbusTransport;
use crate::dispatcher::CommandDispatcher;
use crate::error::{io_err, ServiceError};
use crate::facade::EngineFacade;
use crate::maintenance::MaintenanceProbes;
use crate::registrar::ServiceRegistrar;
use crate::watchdog::IdleWatchdog;

/// Start the service and block the current thread until it exits.
pub fn start_blocking(config: ServiceConfig) -> Result<(), ServiceError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the service until the idle watchdog fires or the process is signalled.
pub async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    // Subscribe before anything can fire.
    let shutdown_rx = shutdown_tx.subscribe();

    tracing::info!(bus = %config.bus, mount = %config.mount_point.display(), "starting btrfs balancer service");

    let registrar = ServiceRegistrar::acquire(ZbusTransport::connect(config.bus), || {
        build_service(&config, shutdown_tx.clone())
    })
    .await;

    let mut registrar = match registrar {
        Ok(registrar) => Some(registrar),
        Err(err) => {
            tracing::error!(error = %err, "service registration failed, serving nothing");
            None
        }
    };

    wait_for_shutdown(shutdown_rx).await?;

    if let Some(registrar) = registrar.as_mut() {
        if let Err(err) = registrar.release().await {
            tracing::warn!(error = %err, "failed to release bus name");
        }
    }
    tracing::info!("btrfs balancer service stopped");
    Ok(())
}

/// Watchdog, engine, facade and dispatcher. Called once the name is held.
fn build_service(config: &ServiceConfig, shutdown: broadcast::Sender<()>) -> Arc<CommandDispatcher> {
    let (watchdog, _countdown) = IdleWatchdog::spawn(IDLE_TIMEOUT, shutdown);
    let (sink, engine_events) = EventSink::channel();
    let engine = Arc::new(BtrfsEngine::new(config, sink));
    let (facade, _pump) = EngineFacade::spawn(engine, engine_events, watchdog);

    let authorizer = CredentialAuthorizer::new(
        Arc::new(ProcFsOwnerLookup::new(&config.proc_root)),
        config.privileged_group.clone(),
    );
    let probes = MaintenanceProbes {
        allocation: Arc::new(BtrfsAllocationProbe::new(config)),
        battery: Arc::new(SysfsBatteryProbe::new(&config.power_supply_dir)),
    };
    Arc::new(CommandDispatcher::new(facade, authorizer, probes))
}

async fn wait_for_shutdown(mut idle: broadcast::Receiver<()>) -> Result<(), ServiceError> {
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;

    tokio::select! {
        _ = idle.recv() => tracing::info!("idle shutdown requested"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received interrupt");
        }
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
