//! A [`Catalog`] that forwards every call to a remote catalog service.

use std::time::Duration;

use async_trait::async_trait;
use generated_types::quarry::catalog::v1::{self as proto, catalog_service_client::CatalogServiceClient};
use quarry_catalog::interface::{Catalog, Error, Result};
use quarry_types::{Partition, TableSchema, TimeRange};
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use crate::serialization::{
    convert_status, deserialize_columns, deserialize_partition, serialize_column,
    serialize_partition, serialize_time_range, ContextExt,
};

/// Catalog client that talks to a [`CatalogService`](crate::CatalogService) over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcCatalogClient {
    uri: Uri,
    channel: Channel,
}

impl GrpcCatalogClient {
    /// Default value for the per request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new client. The connection is established lazily on the first request.
    pub fn new(uri: Uri, request_timeout: Duration) -> Self {
        let channel = Endpoint::from(uri.clone())
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .connect_lazy();
        Self { uri, channel }
    }

    fn client(&self) -> CatalogServiceClient<Channel> {
        CatalogServiceClient::new(self.channel.clone())
    }
}

impl std::fmt::Display for GrpcCatalogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "grpc({})", self.uri)
    }
}

#[async_trait]
impl Catalog for GrpcCatalogClient {
    async fn setup(&self) -> Result<()> {
        // the remote side owns the schema
        debug!(uri=%self.uri, "skipping setup of remote catalog");
        Ok(())
    }

    async fn get_table_schema(&self, tenant_id: &str, table_name: &str) -> Result<TableSchema> {
        let resp = self
            .client()
            .get_table_schema(proto::GetTableSchemaRequest {
                tenant_id: tenant_id.to_owned(),
                table_name: table_name.to_owned(),
            })
            .await
            .map_err(convert_status)?
            .into_inner();

        Ok(TableSchema {
            columns: deserialize_columns(resp.columns).ctx("columns")?,
            tenant_id: resp.tenant_id,
            table_name: resp.table_name,
        })
    }

    async fn get_table_partitions(
        &self,
        tenant_id: Option<&str>,
        table_name: &str,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<Partition>> {
        let resp = self
            .client()
            .get_table_partitions(proto::GetTablePartitionsRequest {
                tenant_id: tenant_id.unwrap_or_default().to_owned(),
                table_name: table_name.to_owned(),
                time_range: time_range.map(serialize_time_range),
            })
            .await
            .map_err(convert_status)?
            .into_inner();

        resp.partitions
            .into_iter()
            .map(|p| {
                deserialize_partition(&resp.tenant_id, &resp.table_name, p)
                    .ctx("partitions")
                    .map_err(Error::from)
            })
            .collect()
    }

    async fn record_new_partition(&self, partition: Partition) -> Result<()> {
        let tenant_id = partition.tenant_id.clone();
        let table_name = partition.table_name.clone();
        let columns = partition
            .columns
            .iter()
            .cloned()
            .map(serialize_column)
            .collect();

        self.client()
            .record_new_partition(proto::RecordNewPartitionRequest {
                tenant_id,
                table_name,
                partition: Some(serialize_partition(partition)),
                columns,
            })
            .await
            .map_err(convert_status)?;

        Ok(())
    }
}
