//! Commands serving and migrating the metadata catalog.

use std::sync::Arc;

use anyhow::Context;
use quarry_catalog::interface::Catalog;
use quarry_clap_blocks::{
    catalog_dsn::CatalogDsnConfig, socket_addr::SocketAddr, workflow_store::WorkflowStoreConfig,
};
use quarry_shutdown::{wait_for_signal, ShutdownManager};
use service_grpc_catalog::CatalogService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The default bind address of the catalog gRPC service.
pub(crate) const DEFAULT_GRPC_BIND_ADDR: &str = "127.0.0.1:8082";

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC reflection error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the catalog gRPC service
    Serve(ServeConfig),

    /// Create or upgrade the catalog schema, and the workflow schema if a workflow store is given
    Migrate(MigrateConfig),
}

#[derive(Debug, clap::Parser)]
struct ServeConfig {
    #[clap(flatten)]
    catalog_dsn: CatalogDsnConfig,

    /// Address the gRPC service listens on.
    #[clap(
        long = "grpc-bind",
        env = "QUARRY_GRPC_BIND_ADDR",
        default_value = DEFAULT_GRPC_BIND_ADDR,
        action,
    )]
    grpc_bind_address: SocketAddr,

    /// Also serve gRPC server reflection.
    #[clap(long = "reflect", env = "QUARRY_GRPC_REFLECTION", action)]
    reflect: bool,
}

#[derive(Debug, clap::Parser)]
struct MigrateConfig {
    #[clap(flatten)]
    catalog_dsn: CatalogDsnConfig,

    #[clap(flatten)]
    workflow_store: WorkflowStoreConfig,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    match config.command {
        Command::Serve(config) => serve_command(config).await,
        Command::Migrate(config) => migrate_command(config).await,
    }
}

async fn serve_command(config: ServeConfig) -> anyhow::Result<()> {
    let catalog = config
        .catalog_dsn
        .get_catalog("quarry-catalog")
        .await
        .context("cannot connect to catalog")?;

    let listener = TcpListener::bind(*config.grpc_bind_address)
        .await
        .with_context(|| format!("cannot bind to {}", config.grpc_bind_address))?;
    info!(address=%listener.local_addr()?, reflect=config.reflect, "catalog service listening");

    let shutdown = ShutdownManager::new();
    let token = shutdown.register("catalog-grpc");

    let mut server = tokio::spawn(serve(
        listener,
        Arc::clone(&catalog),
        config.reflect,
        token.cancellation_token(),
    ));

    let exited = tokio::select! {
        res = wait_for_signal() => {
            if let Err(e) = res {
                error!(%e, "cannot listen for shutdown signals");
            }
            None
        }
        res = &mut server => Some(res),
    };
    shutdown.shutdown();

    // the server stops accepting requests before the pool goes away
    let served = match exited {
        Some(res) => res,
        None => server.await,
    };
    token.complete();
    shutdown.join().await;
    catalog.close().await;
    info!("catalog service stopped");

    served.context("catalog service panicked")??;
    Ok(())
}

async fn migrate_command(config: MigrateConfig) -> anyhow::Result<()> {
    let catalog = config
        .catalog_dsn
        .get_catalog("quarry-migrate")
        .await
        .context("cannot connect to catalog")?;
    catalog.setup().await.context("cannot migrate catalog")?;
    catalog.close().await;
    info!(catalog=%catalog, "catalog migrated");

    if config.workflow_store.dsn.is_some() {
        let store = config
            .workflow_store
            .get_store("quarry-migrate")
            .await
            .context("cannot connect to workflow store")?;
        store
            .setup()
            .await
            .context("cannot migrate workflow store")?;
        store.shutdown().await;
        info!(store=%store, "workflow store migrated");
    }

    Ok(())
}

/// Serve the catalog gRPC service, the health service and optionally server reflection on
/// `listener` until `shutdown` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    catalog: Arc<dyn Catalog>,
    reflect: bool,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let stream = TcpListenerStream::new(listener);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status(
            generated_types::CATALOG_SERVICE_NAME,
            tonic_health::ServingStatus::Serving,
        )
        .await;

    let reflection_service = if reflect {
        Some(
            tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(generated_types::FILE_DESCRIPTOR_SET)
                .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
                .build()?,
        )
    } else {
        None
    };

    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_optional_service(reflection_service)
        .add_service(CatalogService::new(catalog).service())
        .serve_with_incoming_shutdown(stream, shutdown.cancelled())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use quarry_catalog::{interface::Error as CatalogError, mem::MemCatalog};
    use quarry_types::{Column, ColumnType, Partition, TimeRange};
    use service_grpc_catalog::GrpcCatalogClient;
    use tonic_health::pb::{
        health_check_response::ServingStatus, health_client::HealthClient, HealthCheckRequest,
    };

    use super::*;

    #[test_log::test(tokio::test)]
    async fn serves_catalog_and_health() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve(
            listener,
            Arc::new(MemCatalog::new()),
            true,
            shutdown.clone(),
        ));

        let uri: tonic::transport::Uri = format!("http://{addr}").parse().unwrap();
        let client = GrpcCatalogClient::new(uri.clone(), std::time::Duration::from_secs(5));

        client
            .record_new_partition(Partition {
                tenant_id: "acme".into(),
                table_name: "web_requests".into(),
                name: "p1".into(),
                size_bytes: 1024,
                time_range: TimeRange::new(1000, 2000),
                columns: vec![Column::new("id", ColumnType::Int64)],
            })
            .await
            .unwrap();

        let partitions = client
            .get_table_partitions(Some("acme"), "web_requests", Some(TimeRange::new(1500, 2500)))
            .await
            .unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, "p1");

        let err = client
            .get_table_schema("acme", "unknown")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }), "{err}");

        let mut health = HealthClient::new(
            tonic::transport::Endpoint::from(uri)
                .connect()
                .await
                .unwrap(),
        );
        let status = health
            .check(HealthCheckRequest {
                service: generated_types::CATALOG_SERVICE_NAME.into(),
            })
            .await
            .unwrap()
            .into_inner()
            .status;
        assert_eq!(status, ServingStatus::Serving as i32);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
