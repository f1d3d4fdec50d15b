//! Microvm operator
//!
//! Watches Microvm resources in the local store and converges each one
//! against the lifecycle service on its host.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mvm_operator::remote::{ClientFactory, HttpClientFactory, MockClientFactory};
use mvm_operator::store::{SqliteStore, Store};
use mvm_operator::{Config, Controller, MicrovmReconciler};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        db_path = %config.db_path.display(),
        workers = config.workers,
        mock_remote = config.mock_remote,
        "Starting microvm operator"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );

    let client_factory: Arc<dyn ClientFactory> = if config.mock_remote {
        info!("Using in-memory lifecycle service");
        Arc::new(MockClientFactory::new())
    } else {
        Arc::new(HttpClientFactory::new(config.request_timeout()))
    };

    let reconciler = MicrovmReconciler::new(store, Some(client_factory));
    let controller = Controller::new(reconciler, config.controller_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            return result.context("controller task failed");
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    controller_handle.await.context("controller task failed")?;

    info!("Microvm operator shutdown complete");
    Ok(())
}
