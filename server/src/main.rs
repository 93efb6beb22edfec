use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use color_eyre::eyre::WrapErr;
use statusphere::{
    routes,
    setup::{setup_sentry, setup_tracing},
    state::AppState,
};
use tracing::{info, warn};

/// Pending logins older than this are abandoned.
const PENDING_REQUEST_TTL: chrono::Duration = chrono::Duration::hours(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

fn main() -> color_eyre::Result<()> {
    let _sentry_guard = setup_sentry();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("statusphere")?;

    let app_state = AppState::from_env().await?;

    info!("Spawning application tasks");
    let futures = spawn_application_tasks(app_state);

    futures::future::try_join_all(futures).await?;

    Ok(())
}

fn spawn_application_tasks(
    app_state: AppState,
) -> Vec<tokio::task::JoinHandle<color_eyre::Result<()>>> {
    let mut futures = vec![];

    if is_feature_enabled("SERVER") {
        info!("Server Enabled");
        futures.push(tokio::spawn(run_server(app_state.clone())));
    } else {
        info!("Server Disabled");
    }

    if is_feature_enabled("CLEANUP") {
        info!("Cleanup Enabled");
        futures.push(tokio::spawn(run_cleanup(app_state)));
    } else {
        info!("Cleanup Disabled");
    }

    futures
}

async fn run_server(app_state: AppState) -> color_eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], app_state.config.port));
    let app = routes::routes(app_state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_cleanup(app_state: AppState) -> color_eyre::Result<()> {
    let store = app_state.pg_session_store();
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        match store
            .purge_stale_requests(Utc::now() - PENDING_REQUEST_TTL)
            .await
        {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged stale authorization requests"),
            Err(e) => warn!(error = ?e, "failed to purge stale authorization requests"),
        }
    }
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}
