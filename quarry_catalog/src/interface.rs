//! Traits and error types for the Catalog API.

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use quarry_types::{Partition, TableSchema, TimeRange};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unhandled external error: {source}"))]
    External {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("already exists: {descr}"))]
    AlreadyExists { descr: String },

    #[snafu(display("invalid argument: {descr}"))]
    InvalidArgument { descr: String },

    #[snafu(display("not found: {descr}"))]
    NotFound { descr: String },
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::External {
            source: Box::new(e),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::External {
            source: Box::new(e),
        }
    }
}

/// A specialized `Error` for Catalog errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Persistence of table schemas and table partitions.
///
/// Implementations must commit the column upserts and the partition insert of
/// [`record_new_partition`](Self::record_new_partition) atomically.
#[async_trait]
pub trait Catalog: Send + Sync + Debug + Display {
    /// Setup catalog for usage and apply possible migrations.
    async fn setup(&self) -> Result<()>;

    /// The current columns of a table, ordered by name.
    ///
    /// Returns [`Error::NotFound`] when no column is known for the table.
    async fn get_table_schema(&self, tenant_id: &str, table_name: &str) -> Result<TableSchema>;

    /// The partitions of a table, ordered by start time and then by name.
    ///
    /// With a `time_range`, only partitions whose inclusive time range overlaps it are returned.
    /// With a `tenant_id`, only that tenant's partitions are returned. An empty result is
    /// [`Error::NotFound`].
    async fn get_table_partitions(
        &self,
        tenant_id: Option<&str>,
        table_name: &str,
        time_range: Option<TimeRange>,
    ) -> Result<Vec<Partition>>;

    /// Upsert the partition's columns into the table schema and insert the partition, in one
    /// transaction.
    ///
    /// A partition name that already exists for the table is [`Error::AlreadyExists`] and leaves
    /// the catalog unchanged.
    async fn record_new_partition(&self, partition: Partition) -> Result<()>;

    /// Release any connections held by the catalog.
    async fn close(&self) {}
}

pub(crate) fn validate_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return InvalidArgumentSnafu {
            descr: format!("{what} must not be empty"),
        }
        .fail();
    }
    Ok(())
}

pub(crate) fn validate_time_range(time_range: &TimeRange) -> Result<()> {
    if !time_range.is_valid() {
        return InvalidArgumentSnafu {
            descr: format!("time range {time_range} ends before it starts"),
        }
        .fail();
    }
    Ok(())
}

pub(crate) fn validate_partition(partition: &Partition) -> Result<()> {
    validate_name("tenant id", &partition.tenant_id)?;
    validate_name("table name", &partition.table_name)?;
    validate_name("partition name", &partition.name)?;
    validate_time_range(&partition.time_range)?;
    for column in &partition.columns {
        validate_name("column name", &column.name)?;
    }
    Ok(())
}

pub(crate) fn validate_query(
    tenant_id: Option<&str>,
    table_name: &str,
    time_range: Option<&TimeRange>,
) -> Result<()> {
    if let Some(tenant_id) = tenant_id {
        validate_name("tenant id", tenant_id)?;
    }
    validate_name("table name", table_name)?;
    if let Some(time_range) = time_range {
        validate_time_range(time_range)?;
    }
    Ok(())
}

pub(crate) fn schema_not_found(tenant_id: &str, table_name: &str) -> Error {
    Error::NotFound {
        descr: format!("no schema for table {tenant_id}/{table_name}"),
    }
}

pub(crate) fn partitions_not_found(
    tenant_id: Option<&str>,
    table_name: &str,
    time_range: Option<&TimeRange>,
) -> Error {
    let tenant = tenant_id.unwrap_or("*");
    let descr = match time_range {
        Some(r) => format!("no partitions of table {tenant}/{table_name} overlap {r}"),
        None => format!("no partitions for table {tenant}/{table_name}"),
    };
    Error::NotFound { descr }
}

pub(crate) fn partition_exists(partition: &Partition) -> Error {
    Error::AlreadyExists {
        descr: format!(
            "partition {} of table {}/{}",
            partition.name, partition.tenant_id, partition.table_name
        ),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use quarry_types::{Column, ColumnType};

    use super::*;

    fn partition() -> Partition {
        Partition {
            tenant_id: "acme".into(),
            table_name: "web_requests".into(),
            name: "p1".into(),
            size_bytes: 1,
            time_range: TimeRange::new(1, 2),
            columns: vec![Column::new("id", ColumnType::Int64)],
        }
    }

    #[test]
    fn partition_validation() {
        validate_partition(&partition()).unwrap();

        let mut p = partition();
        p.name.clear();
        assert_matches!(validate_partition(&p), Err(Error::InvalidArgument { .. }));

        let mut p = partition();
        p.time_range = TimeRange::new(3, 2);
        assert_matches!(validate_partition(&p), Err(Error::InvalidArgument { .. }));

        let mut p = partition();
        p.columns.push(Column::new("", ColumnType::Utf8));
        assert_matches!(validate_partition(&p), Err(Error::InvalidArgument { .. }));
    }

    #[test]
    fn query_validation() {
        validate_query(None, "t", None).unwrap();
        assert_matches!(
            validate_query(Some(""), "t", None),
            Err(Error::InvalidArgument { .. })
        );
        assert_matches!(
            validate_query(None, "t", Some(&TimeRange::new(10, 0))),
            Err(Error::InvalidArgument { .. })
        );
    }
}
