//! gRPC service for the Catalog, and a client that exposes a remote catalog service as a
//! [`Catalog`].

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

use std::sync::Arc;

use generated_types::quarry::catalog::v1::*;
use quarry_catalog::interface::{Catalog, Error as CatalogError};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

mod client;
mod serialization;

pub use client::GrpcCatalogClient;
use serialization::{
    catalog_error_to_status, deserialize_columns, deserialize_partition, deserialize_time_range,
    serialize_column, serialize_partition, ContextExt, RequiredExt,
};

/// Implementation of the Catalog gRPC service
#[derive(Debug)]
pub struct CatalogService {
    /// Catalog.
    catalog: Arc<dyn Catalog>,
}

impl CatalogService {
    /// Create a new catalog service with the given catalog
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// The tonic service to register with a server.
    pub fn service(self) -> catalog_service_server::CatalogServiceServer<Self> {
        catalog_service_server::CatalogServiceServer::new(self)
    }
}

/// Log a failed catalog call and convert it into a status. A missing table is an expected
/// outcome for readers and only logged at debug level.
fn log_and_convert(e: CatalogError, method: &'static str, tenant_id: &str, table_name: &str) -> Status {
    match &e {
        CatalogError::NotFound { .. } => {
            debug!(error=%e, method, tenant_id, table_name, "catalog lookup found nothing")
        }
        _ => warn!(error=%e, method, tenant_id, table_name, "catalog request failed"),
    }
    catalog_error_to_status(e)
}

#[tonic::async_trait]
impl catalog_service_server::CatalogService for CatalogService {
    async fn get_table_schema(
        &self,
        request: Request<GetTableSchemaRequest>,
    ) -> Result<Response<GetTableSchemaResponse>, Status> {
        let req = request.into_inner();

        let schema = self
            .catalog
            .get_table_schema(&req.tenant_id, &req.table_name)
            .await
            .map_err(|e| log_and_convert(e, "get_table_schema", &req.tenant_id, &req.table_name))?;

        Ok(Response::new(GetTableSchemaResponse {
            tenant_id: schema.tenant_id,
            table_name: schema.table_name,
            columns: schema.columns.into_iter().map(serialize_column).collect(),
        }))
    }

    async fn get_table_partitions(
        &self,
        request: Request<GetTablePartitionsRequest>,
    ) -> Result<Response<GetTablePartitionsResponse>, Status> {
        let req = request.into_inner();
        let tenant_id = (!req.tenant_id.is_empty()).then_some(req.tenant_id.as_str());
        let time_range = req.time_range.map(deserialize_time_range);

        let partitions = self
            .catalog
            .get_table_partitions(tenant_id, &req.table_name, time_range)
            .await
            .map_err(|e| {
                log_and_convert(e, "get_table_partitions", &req.tenant_id, &req.table_name)
            })?;

        Ok(Response::new(GetTablePartitionsResponse {
            partitions: partitions.into_iter().map(serialize_partition).collect(),
            tenant_id: req.tenant_id,
            table_name: req.table_name,
        }))
    }

    async fn record_new_partition(
        &self,
        request: Request<RecordNewPartitionRequest>,
    ) -> Result<Response<RecordNewPartitionResponse>, Status> {
        let req = request.into_inner();

        let mut partition = deserialize_partition(
            &req.tenant_id,
            &req.table_name,
            req.partition.required().ctx("partition")?,
        )
        .ctx("partition")?;
        // the request's tenant and columns are authoritative
        partition.tenant_id = req.tenant_id.clone();
        partition.columns = deserialize_columns(req.columns).ctx("columns")?;

        let name = partition.name.clone();
        self.catalog
            .record_new_partition(partition)
            .await
            .map_err(|e| log_and_convert(e, "record_new_partition", &req.tenant_id, &req.table_name))?;

        debug!(
            tenant_id=%req.tenant_id,
            table_name=%req.table_name,
            partition=%name,
            "recorded new partition"
        );
        Ok(Response::new(RecordNewPartitionResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use assert_matches::assert_matches;
    use generated_types::quarry::catalog::v1::catalog_service_server::CatalogService as _;
    use quarry_catalog::mem::MemCatalog;
    use quarry_types::{Column, ColumnType, Partition, TimeRange as DomainTimeRange};
    use tokio::{net::TcpListener, task::JoinSet};
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{
        transport::{Server, Uri},
        Code,
    };

    use super::*;

    fn service() -> (Arc<MemCatalog>, CatalogService) {
        let catalog = Arc::new(MemCatalog::new());
        let service = CatalogService::new(Arc::clone(&catalog) as _);
        (catalog, service)
    }

    fn record_request(name: &str, start: i64, end: i64) -> RecordNewPartitionRequest {
        RecordNewPartitionRequest {
            tenant_id: "acme".into(),
            table_name: "web_requests".into(),
            partition: Some(generated_types::quarry::catalog::v1::Partition {
                name: name.into(),
                size: 1024,
                time_range: Some(TimeRange {
                    start_time: start,
                    end_time: end,
                }),
                columns: vec![],
                tenant_id: String::new(),
            }),
            columns: vec![TableColumn {
                name: "id".into(),
                r#type: ColumnType::Int64.as_i16().into(),
            }],
        }
    }

    #[test_log::test(tokio::test)]
    async fn record_then_query() {
        let (catalog, service) = service();

        service
            .record_new_partition(Request::new(record_request("p1", 1000, 2000)))
            .await
            .unwrap();

        let stored = catalog
            .get_table_partitions(Some("acme"), "web_requests", None)
            .await
            .unwrap();
        assert_eq!(
            stored,
            vec![Partition {
                tenant_id: "acme".into(),
                table_name: "web_requests".into(),
                name: "p1".into(),
                size_bytes: 1024,
                time_range: DomainTimeRange::new(1000, 2000),
                columns: vec![Column::new("id", ColumnType::Int64)],
            }]
        );

        let schema = service
            .get_table_schema(Request::new(GetTableSchemaRequest {
                tenant_id: "acme".into(),
                table_name: "web_requests".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(schema.columns.len(), 1);
        assert_eq!(schema.columns[0].name, "id");
        assert_eq!(schema.columns[0].r#type, i32::from(ColumnType::Int64.as_i16()));

        let partitions = service
            .get_table_partitions(Request::new(GetTablePartitionsRequest {
                tenant_id: String::new(),
                table_name: "web_requests".into(),
                time_range: Some(TimeRange {
                    start_time: 1500,
                    end_time: 2500,
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(partitions.partitions.len(), 1);
        assert_eq!(partitions.partitions[0].name, "p1");
        assert_eq!(partitions.partitions[0].tenant_id, "acme");

        let status = service
            .get_table_partitions(Request::new(GetTablePartitionsRequest {
                tenant_id: "acme".into(),
                table_name: "web_requests".into(),
                time_range: Some(TimeRange {
                    start_time: 3000,
                    end_time: 4000,
                }),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[test_log::test(tokio::test)]
    async fn error_codes() {
        let (_catalog, service) = service();

        let status = service
            .get_table_schema(Request::new(GetTableSchemaRequest {
                tenant_id: "acme".into(),
                table_name: "missing".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        service
            .record_new_partition(Request::new(record_request("p1", 0, 10)))
            .await
            .unwrap();
        let status = service
            .record_new_partition(Request::new(record_request("p1", 0, 10)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status = service
            .record_new_partition(Request::new(record_request("p2", 10, 0)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let mut missing_partition = record_request("p3", 0, 10);
        missing_partition.partition = None;
        let status = service
            .record_new_partition(Request::new(missing_partition))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "partition: required");

        let mut missing_range = record_request("p4", 0, 10);
        if let Some(p) = missing_range.partition.as_mut() {
            p.time_range = None;
        }
        let status = service
            .record_new_partition(Request::new(missing_range))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test_log::test(tokio::test)]
    async fn test_catalog_over_grpc() {
        quarry_catalog::interface_tests::test_catalog(|| async {
            let backing_catalog = Arc::new(MemCatalog::new());
            let test_server = TestServer::new(backing_catalog).await;
            let client = GrpcCatalogClient::new(
                test_server.uri(),
                GrpcCatalogClient::DEFAULT_REQUEST_TIMEOUT,
            );

            Arc::new(TestCatalog {
                client,
                _server: test_server,
            }) as Arc<dyn Catalog>
        })
        .await;
    }

    #[test_log::test(tokio::test)]
    async fn client_maps_status_codes() {
        let test_server = TestServer::new(Arc::new(MemCatalog::new())).await;
        let client = GrpcCatalogClient::new(
            test_server.uri(),
            GrpcCatalogClient::DEFAULT_REQUEST_TIMEOUT,
        );

        assert_matches!(
            client.get_table_schema("acme", "missing").await,
            Err(CatalogError::NotFound { .. })
        );
    }

    /// Keeps the server alive for as long as the client is in use.
    #[derive(Debug)]
    struct TestCatalog {
        client: GrpcCatalogClient,
        _server: TestServer,
    }

    impl std::fmt::Display for TestCatalog {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            std::fmt::Display::fmt(&self.client, f)
        }
    }

    #[async_trait::async_trait]
    impl Catalog for TestCatalog {
        async fn setup(&self) -> quarry_catalog::interface::Result<()> {
            self.client.setup().await
        }

        async fn get_table_schema(
            &self,
            tenant_id: &str,
            table_name: &str,
        ) -> quarry_catalog::interface::Result<quarry_types::TableSchema> {
            self.client.get_table_schema(tenant_id, table_name).await
        }

        async fn get_table_partitions(
            &self,
            tenant_id: Option<&str>,
            table_name: &str,
            time_range: Option<DomainTimeRange>,
        ) -> quarry_catalog::interface::Result<Vec<Partition>> {
            self.client
                .get_table_partitions(tenant_id, table_name, time_range)
                .await
        }

        async fn record_new_partition(
            &self,
            partition: Partition,
        ) -> quarry_catalog::interface::Result<()> {
            self.client.record_new_partition(partition).await
        }
    }

    #[derive(Debug)]
    struct TestServer {
        addr: SocketAddr,
        #[allow(dead_code)]
        task: JoinSet<()>,
    }

    impl TestServer {
        async fn new(catalog: Arc<dyn Catalog>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let incoming = TcpListenerStream::new(listener);
            let mut task = JoinSet::new();
            task.spawn(async move {
                Server::builder()
                    .add_service(CatalogService::new(catalog).service())
                    .serve_with_incoming(incoming)
                    .await
                    .unwrap();
            });

            Self { addr, task }
        }

        fn uri(&self) -> Uri {
            format!("http://{}:{}", self.addr.ip(), self.addr.port())
                .parse()
                .unwrap()
        }
    }
}
