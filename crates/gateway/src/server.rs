//! Process bootstrap: binds the HTTP ingress router and the usage-limit
//! housekeeper as managed subsystems. Mirrors `soma::server::start_axum_server`
//! (bind/handle/graceful-shutdown shape), built on `shared::subsystem` rather
//! than the `tokio-graceful-shutdown` crate the teacher vendors for its own
//! CLI process, since this service has no Vite dev server or CLI commands to
//! fold into that heavier abstraction.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use shared::error::CommonError;
use shared::port::find_free_port;
use shared::subsystem::{SubsystemHandle, spawn_subsystem};
use tokio::sync::broadcast;

use crate::logic::usage::run_housekeeper;
use crate::router::gateway_router;
use crate::service::GatewayService;

/// A one-shot shutdown hook, run once and dropped. `shared` carries no
/// equivalent of its own (the teacher's `soma::server` reaches for one under
/// `shared::process_manager`, a module that doesn't actually exist in this
/// workspace), so this is defined locally from the shape its call sites need.
pub type ShutdownCallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct StartGatewayServerParams {
    pub host: String,
    pub port: u16,
    pub service: GatewayService,
    pub usage_limit_cleanup_interval: Duration,
}

pub struct StartGatewayServerResult {
    pub server_fut: Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send>>,
    pub handle: axum_server::Handle,
    pub addr: SocketAddr,
    pub housekeeper: SubsystemHandle,
    pub on_shutdown_triggered: ShutdownCallback,
    pub on_shutdown_complete: ShutdownCallback,
}

/// Binds the gateway's HTTP router and spawns the usage-limit housekeeper.
/// The returned `server_fut` must be awaited (or spawned) by the caller; the
/// housekeeper is already running in the background and is joined via
/// `housekeeper.wait_for_shutdown()` once `on_shutdown_triggered` fires.
pub async fn start_gateway_server(
    params: StartGatewayServerParams,
) -> Result<StartGatewayServerResult, CommonError> {
    let port = find_free_port(params.port, params.port + 100)?;
    let addr: SocketAddr = format!("{}:{}", params.host, port)
        .parse()
        .map_err(|e| CommonError::AddrParseError { source: e })?;

    tracing::debug!(address = %addr, "starting gateway server");

    let handle = axum_server::Handle::new();
    let router = gateway_router(params.service.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let housekeeper = spawn_subsystem(
        "usage-limit-housekeeper",
        shutdown_tx.subscribe(),
        run_housekeeper(
            params.service.store.clone(),
            params.usage_limit_cleanup_interval,
            shutdown_rx,
        ),
    );

    let server_fut = Box::pin(
        axum_server::bind(addr)
            .handle(handle.clone())
            .serve(router.into_make_service()),
    );

    let handle_for_shutdown = handle.clone();
    let on_shutdown_triggered: ShutdownCallback = Box::new(move || {
        let handle = handle_for_shutdown.clone();
        let shutdown_tx = shutdown_tx.clone();
        Box::pin(async move {
            tracing::debug!("shutting down gateway server, waiting for in-flight requests");
            let _ = shutdown_tx.send(());
            handle.graceful_shutdown(Some(Duration::from_secs(30)));
        })
    });

    let on_shutdown_complete: ShutdownCallback = Box::new(move || {
        Box::pin(async move {
            tracing::debug!("gateway server shut down");
        })
    });

    tracing::trace!("gateway server bound");
    Ok(StartGatewayServerResult {
        server_fut,
        handle,
        addr,
        housekeeper,
        on_shutdown_triggered,
        on_shutdown_complete,
    })
}
