mod maintenance;
mod problem;
mod router;
mod send;
mod telemetry;
#[cfg(test)]
mod test_support;
mod tracking;
mod wiring;

use std::{net::SocketAddr, sync::Arc};

use mutuus_notify_storage::Database;
use mutuus_notify_util::{load_env_file, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let engine = wiring::build_engine(&config, &database, wiring::ProviderUrls::production()?)?;
    maintenance::MaintenanceWorker::new(engine.clone(), database.clone()).spawn();

    let tracking_secret = config
        .tracking_webhook_secret
        .as_ref()
        .map(|secret| Arc::<[u8]>::from(secret.as_bytes()));
    let state = router::AppState::new(metrics, database, engine, tracking_secret, &config.site_url);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        lease_store = ?config.lease_store,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
