mod executors;
mod scheduler;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use datastage_core::config::AppConfig;
use datastage_core::credentials::{CredentialDecoder, TokenCipher};
use datastage_core::staging::StagingPaths;
use datastage_core::store::DatasetStore;
use datastage_core::telemetry;
use tracing::info;

use executors::{Executors, gdrive::GoogleDriveExecutor, local::LocalExecutor, s3::S3Executor, url::UrlExecutor};
use scheduler::UploadScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| "worker-uploads".to_string());
    telemetry::init(&service_name)?;

    // Load centralized configuration - fail fast if required config is missing
    let config = AppConfig::from_env()?;

    let store = DatasetStore::connect(&config.database).await?;
    store.run_migrations().await?;

    let staging = StagingPaths::new(config.staging.clone());
    let cipher = TokenCipher::derive(&config.secrets);
    let credentials = CredentialDecoder::new(store.pool().clone(), cipher);

    let executors = Arc::new(Executors::new(
        LocalExecutor::new(config.staging.scratch_base.clone()),
        GoogleDriveExecutor::new(credentials, &config.secrets),
        S3Executor::new(),
        UrlExecutor::new(),
    ));

    // One single-threaded scheduler loop per job slot; parallelism across
    // datasets comes from running more loops, not from fanning out inside
    // one.
    let slots = config.pipeline.max_concurrent_jobs.max(1);
    let mut handles = Vec::with_capacity(slots);
    for slot in 0..slots {
        let scheduler = UploadScheduler::new(
            store.clone(),
            Arc::clone(&executors),
            staging.clone(),
            config.pipeline.clone(),
            worker_id(slot),
        );
        handles.push(tokio::spawn(async move { scheduler.run().await }));
    }
    info!(slots, "Upload worker started");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received; abandoned claims will be reaped");
        }
        _ = futures_util::future::join_all(handles) => {}
    }
    Ok(())
}

fn worker_id(slot: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "uploads".to_string());
    format!("{host}-{}-u{slot}", std::process::id())
}

/// Wait for shutdown signals (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
