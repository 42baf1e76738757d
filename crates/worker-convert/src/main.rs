mod scheduler;

use anyhow::Result;
use datastage_core::config::AppConfig;
use datastage_core::reaper;
use datastage_core::staging::StagingPaths;
use datastage_core::store::DatasetStore;
use datastage_core::telemetry;
use tracing::info;

use scheduler::ConversionScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let service_name =
        std::env::var("SERVICE_NAME").unwrap_or_else(|_| "worker-convert".to_string());
    telemetry::init(&service_name)?;

    // Load centralized configuration - fail fast if required config is missing
    let config = AppConfig::from_env()?;

    let store = DatasetStore::connect(&config.database).await?;
    store.run_migrations().await?;

    let staging = StagingPaths::new(config.staging.clone());

    // The reaper rides along with the conversion worker; its conditional
    // updates make it safe to run more than one instance.
    let reaper_handle =
        reaper::spawn_reaper(store.clone(), staging.clone(), config.pipeline.clone());

    let slots = config.pipeline.max_concurrent_jobs.max(1);
    let mut handles = Vec::with_capacity(slots);
    for slot in 0..slots {
        let scheduler = ConversionScheduler::new(
            store.clone(),
            staging.clone(),
            config.pipeline.clone(),
            worker_id(slot),
        );
        handles.push(tokio::spawn(async move { scheduler.run().await }));
    }
    info!(slots, "Conversion worker started");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received; abandoned claims will be reaped");
        }
        _ = futures_util::future::join_all(handles) => {}
    }
    reaper_handle.abort();
    Ok(())
}

fn worker_id(slot: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "convert".to_string());
    format!("{host}-{}-c{slot}", std::process::id())
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
