//! Command running an ingest worker.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use quarry_clap_blocks::{
    catalog_dsn::CatalogDsnConfig, transform::TransformCliConfig, worker::WorkerCliConfig,
    workflow_store::WorkflowStoreConfig,
};
use quarry_shutdown::{wait_for_signal, ShutdownManager};
use quarry_transform::{TransformConfig, TransformSupervisor};
use quarry_workflow::{activity::SupervisedActivities, worker::IngestWorker};
use tracing::{error, info, warn};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    catalog_dsn: CatalogDsnConfig,

    #[clap(flatten)]
    workflow_store: WorkflowStoreConfig,

    #[clap(flatten)]
    transform: TransformCliConfig,

    #[clap(flatten)]
    worker: WorkerCliConfig,

    /// Time in-flight runs get to be released after a shutdown signal.
    #[clap(
        long = "shutdown-grace-period",
        env = "QUARRY_SHUTDOWN_GRACE_PERIOD",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    shutdown_grace_period: Duration,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let transform = TransformConfig::from(&config.transform);
    let worker_config = config.worker.worker_config(transform.heartbeat_interval);

    let catalog = config
        .catalog_dsn
        .get_catalog("quarry-worker")
        .await
        .context("cannot connect to catalog")?;
    let store = config
        .workflow_store
        .get_store("quarry-worker")
        .await
        .context("cannot connect to workflow store")?;

    let activities = Arc::new(SupervisedActivities::new(
        TransformSupervisor::new(transform),
        Arc::clone(&catalog),
    ));
    let worker = Arc::new(
        IngestWorker::new(worker_config, Arc::clone(&store), activities)
            .context("invalid worker configuration")?,
    );
    info!(
        worker_id = %worker.config().worker_id,
        catalog = %catalog,
        store = %store,
        "starting ingest worker"
    );

    let shutdown = ShutdownManager::new();
    let token = shutdown.register("ingest-worker");
    tokio::spawn(async move {
        worker.run(token.cancellation_token()).await;
        token.complete();
    });

    if let Err(e) = wait_for_signal().await {
        error!(%e, "cannot listen for shutdown signals");
    }
    shutdown.shutdown();

    // in-flight runs are interrupted and released before the pools close
    if !shutdown
        .join_with_timeout(config.shutdown_grace_period)
        .await
    {
        warn!("shutting down with runs still claimed; they are resumed once their claims expire");
    }
    store.shutdown().await;
    catalog.close().await;
    info!("ingest worker stopped");

    Ok(())
}
