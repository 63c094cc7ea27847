//! This module implements an in-memory implementation of the catalog. It can be used for testing
//! or for a single process deployment of the pipeline.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_types::{Column, ColumnType, Partition, TableSchema, TimeRange};
use tracing::debug;

use crate::interface::{
    partition_exists, partitions_not_found, schema_not_found, validate_name, validate_partition,
    validate_query, Catalog, Result,
};

/// In-memory catalog that implements the `Catalog` trait.
#[derive(Debug, Default)]
pub struct MemCatalog {
    collections: Mutex<MemCollections>,
}

#[derive(Debug, Default)]
struct MemCollections {
    /// Keyed by `(tenant_id, table_name, column_name)`.
    columns: BTreeMap<(String, String, String), ColumnType>,
    partitions: Vec<Partition>,
}

impl MemCatalog {
    /// return new initialized `MemCatalog`
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        // nothing to do
        Ok(())
    }

    async fn get_table_schema(&self, tenant_id: &str, table_name: &str) -> Result<TableSchema> {
        validate_name("tenant id", tenant_id)?;
        validate_name("table name", table_name)?;

        let collections = self.collections.lock();
        let columns: Vec<_> = collections
            .columns
            .iter()
            .filter(|((t, tbl, _), _)| t == tenant_id && tbl == table_name)
            .map(|((_, _, name), column_type)| Column::new(name.clone(), *column_type))
            .collect();

        if columns.is_empty() {
            return Err(schema_not_found(tenant_id, table_name));
        }

        Ok(TableSchema {
            tenant_id: tenant_id.to_owned(),
            table_name: table_name.to_owned(),
            columns,
        })
    }

    async fn get_table_partitions(
        &self,
        tenant_id: Option<&str>,
        table_name: &str,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<Partition>> {
        validate_query(tenant_id, table_name, time_range.as_ref())?;

        let collections = self.collections.lock();
        let mut partitions: Vec<_> = collections
            .partitions
            .iter()
            .filter(|p| p.table_name == table_name)
            .filter(|p| tenant_id.map_or(true, |t| p.tenant_id == t))
            .filter(|p| time_range.map_or(true, |r| p.time_range.overlaps(&r)))
            .cloned()
            .collect();

        if partitions.is_empty() {
            return Err(partitions_not_found(
                tenant_id,
                table_name,
                time_range.as_ref(),
            ));
        }

        partitions.sort_by(|a, b| {
            (a.time_range.start, &a.name).cmp(&(b.time_range.start, &b.name))
        });
        Ok(partitions)
    }

    async fn record_new_partition(&self, partition: Partition) -> Result<()> {
        validate_partition(&partition)?;

        // Holding the lock for the whole operation makes the column upserts and the partition
        // insert atomic.
        let mut collections = self.collections.lock();
        let exists = collections.partitions.iter().any(|p| {
            p.tenant_id == partition.tenant_id
                && p.table_name == partition.table_name
                && p.name == partition.name
        });
        if exists {
            return Err(partition_exists(&partition));
        }

        for column in &partition.columns {
            collections.columns.insert(
                (
                    partition.tenant_id.clone(),
                    partition.table_name.clone(),
                    column.name.clone(),
                ),
                column.column_type,
            );
        }

        debug!(
            tenant_id=%partition.tenant_id,
            table_name=%partition.table_name,
            partition=%partition.name,
            "recorded partition"
        );
        collections.partitions.push(partition);

        Ok(())
    }
}
