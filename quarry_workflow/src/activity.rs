//! The side effects of the ingest workflow.

use std::sync::Arc;

use async_trait::async_trait;
use quarry_catalog::interface::{Catalog, Error as CatalogError};
use quarry_transform::{Heartbeat, TransformSupervisor};
use quarry_types::{Partition, TransformRequest};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("transform failed: {0}")]
    Transform(#[from] quarry_transform::Error),

    #[error("catalog call failed: {0}")]
    Catalog(#[from] CatalogError),
}

/// The steps the ingest workflow sequences.
#[async_trait]
pub trait IngestActivities: Send + Sync + std::fmt::Debug {
    /// Run the transformation for `request`, emitting heartbeats while it runs and stopping when
    /// `cancel` fires.
    async fn transform(
        &self,
        request: &TransformRequest,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Partition, ActivityError>;

    /// Record the partition and its columns in the catalog.
    async fn record_partition(&self, partition: &Partition) -> Result<(), ActivityError>;

    /// Whether the catalog already holds exactly this partition.
    async fn partition_recorded(&self, partition: &Partition) -> Result<bool, ActivityError>;
}

/// Runs the transformation binary and records its output in a catalog.
#[derive(Debug)]
pub struct SupervisedActivities {
    supervisor: TransformSupervisor,
    catalog: Arc<dyn Catalog>,
}

impl SupervisedActivities {
    pub fn new(supervisor: TransformSupervisor, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            supervisor,
            catalog,
        }
    }
}

#[async_trait]
impl IngestActivities for SupervisedActivities {
    async fn transform(
        &self,
        request: &TransformRequest,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Partition, ActivityError> {
        Ok(self.supervisor.run(request, heartbeat, cancel).await?)
    }

    async fn record_partition(&self, partition: &Partition) -> Result<(), ActivityError> {
        Ok(self.catalog.record_new_partition(partition.clone()).await?)
    }

    async fn partition_recorded(&self, partition: &Partition) -> Result<bool, ActivityError> {
        match self
            .catalog
            .get_table_partitions(
                Some(&partition.tenant_id),
                &partition.table_name,
                Some(partition.time_range),
            )
            .await
        {
            Ok(partitions) => Ok(partitions.iter().any(|p| p == partition)),
            Err(CatalogError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
