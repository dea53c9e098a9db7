//! Ajo orchestrator entry point.
//!
//! Starts a background driver that deploys the configured circle and runs
//! its cycles against the ledger RPC, journaling every outcome to SQLite.
//! Simultaneously exposes a small Axum REST API over the journal.

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ajo_orchestrator::api::{self, ApiState};
use ajo_orchestrator::config::Config;
use ajo_orchestrator::db;
use ajo_orchestrator::driver::{self, DriverState};
use ajo_orchestrator::ledger::rpc::RpcLedger;
use ajo_orchestrator::retry::RetryExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let cancel = CancellationToken::new();

    // ─── Background driver ────────────────────────────────
    let driver_state = Arc::new(DriverState {
        pool: pool.clone(),
        ledger: Arc::new(RpcLedger::new(client, config.rpc_url.clone())),
        retry: RetryExecutor::new(config.retry.clone()),
        config: config.clone(),
    });
    let driver = tokio::spawn(driver::run(driver_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState { pool }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    driver.await?;
    Ok(())
}
