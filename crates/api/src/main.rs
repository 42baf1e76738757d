mod api;
mod errors;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use anyhow::Result;
use datastage_core::config::AppConfig;
use datastage_core::sessions::SessionManager;
use datastage_core::staging::StagingPaths;
use datastage_core::store::DatasetStore;
use datastage_core::telemetry;
use dotenvy::dotenv;
use tracing::{error, info};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: DatasetStore,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) staging: StagingPaths,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| "datastage-api".to_string());
    telemetry::init(&service_name)?;

    // Load centralized configuration - fail fast if required config is missing
    let config = AppConfig::from_env()?;

    let store = DatasetStore::connect(&config.database).await?;
    store.run_migrations().await?;

    let staging = StagingPaths::new(config.staging.clone());
    let sessions = Arc::new(SessionManager::new(
        config.staging.scratch_base.clone(),
        config.pipeline.chunk_size_bytes,
        config.pipeline.max_file_size_bytes,
        config.pipeline.session_expiry,
    ));

    // Abandoned chunked-upload sessions are reaped in-process; they are
    // this process's state and die with it.
    let session_reaper = {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = sessions.reap_expired().await;
                if reaped > 0 {
                    info!(reaped, "Reaped expired chunked-upload sessions");
                }
            }
        })
    };

    let state = AppState { store, sessions, staging };
    // Chunk uploads arrive as raw bodies; allow one full chunk plus slack.
    let payload_limit = (config.pipeline.chunk_size_bytes as usize) + 1024 * 1024;

    let hostname = config.server.hostname.clone();
    let port = config.server.port;
    info!(%hostname, port, "Starting datastage API");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(payload_limit))
            .app_data(web::JsonConfig::default().limit(1024 * 1024))
            .configure(api::configure)
    })
    .bind((hostname.as_str(), port))?
    .run();

    let result = server.await;
    session_reaper.abort();
    if let Err(e) = &result {
        error!(error = %e, "API server exited with error");
    }
    Ok(result?)
}
