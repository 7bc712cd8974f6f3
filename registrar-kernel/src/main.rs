/**
 * REGISTRAR KERNEL - Entry point of the machine registration service
 *
 * ROLE : wires config, registry store, backend client, reconciliation loop
 * and the REST API together.
 *
 * STARTUP : restore the snapshot (a corrupt one stops the process), run one
 * reconciliation cycle, then serve HTTP while the loop runs every interval.
 * SHUTDOWN : Ctrl-C stops the server, the in-flight cycle completes, a final
 * snapshot is written.
 */

mod backend;
mod config;
mod diff;
mod error;
mod health;
mod http;
mod lifecycle;
mod literal;
mod matcher;
mod models;
mod patch;
mod reconcile;
mod state;
mod store;

use crate::backend::{IronicClient, ProvisioningBackend};
use crate::config::load_config;
use crate::health::CycleTracker;
use crate::http::AppState;
use crate::reconcile::Reconciler;
use crate::state::new_state;
use crate::store::RegistryStore;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,registrar_kernel=debug")),
        )
        .init();

    let cfg = load_config().await;

    let store = RegistryStore::open(&cfg.state_file, cfg.bootstrap_file.as_deref())
        .inspect_err(|e| error!(error = %e, "cannot restore registry"))
        .with_context(|| format!("restoring registry from {}", cfg.state_file.display()))?;
    let store = new_state(store);

    let backend: Arc<dyn ProvisioningBackend> =
        Arc::new(IronicClient::new(&cfg.backend).context("building backend client")?);
    info!(
        endpoint = %cfg.backend.endpoint,
        auth = backend.auth_enabled(),
        "backend client ready"
    );

    let tracker = CycleTracker::new();
    let reconciler = Arc::new(Reconciler::new(store.clone(), backend.clone(), tracker.clone()));

    // first cycle right away, before serving
    reconciler.run_tracked().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let period = Duration::from_secs(cfg.cycle_interval_secs.max(1));
    let loop_handle = reconciler.spawn(period, shutdown_rx);

    let app = http::build_router(AppState {
        store: store.clone(),
        backend,
        tracker,
    });

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(addr = %cfg.listen, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
        .context("HTTP server")?;

    shutdown_tx.send(true).ok();
    if let Err(e) = loop_handle.await {
        error!(error = %e, "reconciliation loop ended abnormally");
    }
    store.lock().persist();
    info!("registrar stopped");
    Ok(())
}
