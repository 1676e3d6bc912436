mod problem;
mod router;
mod services;
mod telemetry;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use hcm_storage::Database;
use hcm_util::{load_env_file, AppConfig};

use crate::services::{Collaborators, PipelineSettings, Services};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", database_url = %config.database_url, "database ready");

    let collaborators = Collaborators::from_config(&config, Arc::new(database.error_details()))?;
    let services = Services::build(
        &database,
        &collaborators,
        PipelineSettings::from_config(&config),
    );
    let state = router::AppState::new(metrics, database, services);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
