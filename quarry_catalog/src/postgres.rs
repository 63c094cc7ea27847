//! A Postgres backed implementation of the Catalog

use std::{collections::BTreeMap, fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use quarry_types::{Column, ColumnType, Partition, TableSchema, TimeRange};
use sqlx::{
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
    ConnectOptions, Executor, PgPool, Postgres, Transaction,
};
use tracing::{debug, info, log::LevelFilter};

use crate::{
    interface::{
        partition_exists, partitions_not_found, schema_not_found, validate_name,
        validate_partition, validate_query, Catalog, Error, Result,
    },
    retry::RetryConfig,
};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Postgres connection options.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Application name.
    ///
    /// This will be reported to postgres.
    pub app_name: String,

    /// Schema name.
    pub schema_name: String,

    /// DSN.
    pub dsn: String,

    /// Maximum number of concurrent connections.
    pub max_conns: u32,

    /// Set the amount of time to attempt connecting to the database.
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    pub idle_timeout: Duration,
}

impl PostgresConnectionOptions {
    /// Default value for [`schema_name`](Self::schema_name).
    pub const DEFAULT_SCHEMA_NAME: &'static str = "quarry_catalog";

    /// Default value for [`max_conns`](Self::max_conns).
    pub const DEFAULT_MAX_CONNS: u32 = 10;

    /// Default value for [`connect_timeout`](Self::connect_timeout).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for [`idle_timeout`](Self::idle_timeout).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            app_name: String::from("quarry"),
            schema_name: String::from(Self::DEFAULT_SCHEMA_NAME),
            dsn: String::new(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// PostgreSQL catalog.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: PgPool,
    retry: RetryConfig,
    // Connection options for display
    options: PostgresConnectionOptions,
}

impl PostgresCatalog {
    /// Connect to the catalog store.
    pub async fn connect(options: PostgresConnectionOptions, retry: RetryConfig) -> Result<Self> {
        let pool = new_pool(&options).await?;

        Ok(Self {
            pool,
            retry,
            options,
        })
    }

    fn schema_name(&self) -> &str {
        &self.options.schema_name
    }

    async fn try_record_new_partition(&self, partition: &Partition) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE;")
            .execute(&mut *tx)
            .await?;

        upsert_columns(
            &mut tx,
            &partition.tenant_id,
            &partition.table_name,
            &partition.columns,
        )
        .await?;

        sqlx::query(
            r#"
INSERT INTO table_partitions
    ( tenant_id, table_name, partition_name, size_bytes, start_time, end_time, columns )
VALUES
    ( $1, $2, $3, $4, $5, $6, $7 );
            "#,
        )
        .bind(&partition.tenant_id) // $1
        .bind(&partition.table_name) // $2
        .bind(&partition.name) // $3
        .bind(partition.size_bytes) // $4
        .bind(partition.time_range.start) // $5
        .bind(partition.time_range.end) // $6
        .bind(Json(&partition.columns)) // $7
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }
}

impl Display for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not include ANY credentials or secrets in the output
        write!(
            f,
            "Postgres(schema={}, max_conns={})",
            self.options.schema_name, self.options.max_conns
        )
    }
}

/// Upsert the columns ordered by name, so that concurrent writers acquire row locks in the same
/// order. Duplicate names keep the last type given.
async fn upsert_columns(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    table_name: &str,
    columns: &[Column],
) -> Result<(), sqlx::Error> {
    if columns.is_empty() {
        return Ok(());
    }

    let by_name: BTreeMap<&str, ColumnType> = columns
        .iter()
        .map(|c| (c.name.as_str(), c.column_type))
        .collect();
    let (names, types): (Vec<&str>, Vec<i16>) = by_name
        .into_iter()
        .map(|(name, column_type)| (name, column_type.as_i16()))
        .unzip();

    sqlx::query(
        r#"
INSERT INTO table_schemas ( tenant_id, table_name, column_name, column_type, updated_at )
SELECT $1, $2, name, column_type, now()
FROM UNNEST($3::text[], $4::smallint[]) AS new_columns(name, column_type)
ORDER BY name
ON CONFLICT (tenant_id, table_name, column_name)
DO UPDATE SET column_type = EXCLUDED.column_type, updated_at = EXCLUDED.updated_at;
        "#,
    )
    .bind(tenant_id) // $1
    .bind(table_name) // $2
    .bind(names) // $3
    .bind(types) // $4
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<()> {
        // We need to create the schema if we're going to set it as the first item of the
        // search_path otherwise when we run the sqlx migration scripts for the first time, sqlx
        // will create the `_sqlx_migrations` table in the public namespace (the only namespace
        // that exists), but the second time it will create it in the `<schema_name>` namespace and
        // re-run all the migrations without skipping the ones already applied.
        let create_schema_query = format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema_name());
        self.pool.execute(sqlx::query(&create_schema_query)).await?;

        MIGRATOR.run(&self.pool).await?;
        info!(schema_name = self.schema_name(), "catalog migrations applied");

        Ok(())
    }

    async fn get_table_schema(&self, tenant_id: &str, table_name: &str) -> Result<TableSchema> {
        validate_name("tenant id", tenant_id)?;
        validate_name("table name", table_name)?;

        let rows = sqlx::query_as::<_, ColumnRow>(
            r#"
SELECT column_name, column_type
FROM table_schemas
WHERE tenant_id = $1 AND table_name = $2
ORDER BY column_name;
            "#,
        )
        .bind(tenant_id) // $1
        .bind(table_name) // $2
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(schema_not_found(tenant_id, table_name));
        }

        let columns = rows
            .into_iter()
            .map(Column::try_from)
            .collect::<Result<Vec<_>>>()?;

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

        // Inclusive overlap: neither range ends before the other starts.
        let rows = sqlx::query_as::<_, PartitionRow>(
            r#"
SELECT tenant_id, table_name, partition_name, size_bytes, start_time, end_time, columns
FROM table_partitions
WHERE table_name = $1
  AND ($2::text IS NULL OR tenant_id = $2)
  AND ($3::bigint IS NULL OR (start_time <= $4::bigint AND end_time >= $3::bigint))
ORDER BY start_time, partition_name;
            "#,
        )
        .bind(table_name) // $1
        .bind(tenant_id) // $2
        .bind(time_range.map(|r| r.start)) // $3
        .bind(time_range.map(|r| r.end)) // $4
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(partitions_not_found(
                tenant_id,
                table_name,
                time_range.as_ref(),
            ));
        }

        Ok(rows.into_iter().map(Partition::from).collect())
    }

    async fn record_new_partition(&self, partition: Partition) -> Result<()> {
        validate_partition(&partition)?;

        self.retry
            .retry("record_new_partition", is_transient, || {
                self.try_record_new_partition(&partition)
            })
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    partition_exists(&partition)
                } else {
                    Error::from(e)
                }
            })?;

        debug!(
            tenant_id=%partition.tenant_id,
            table_name=%partition.table_name,
            partition=%partition.name,
            "recorded partition"
        );
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ColumnRow {
    column_name: String,
    column_type: i16,
}

impl TryFrom<ColumnRow> for Column {
    type Error = Error;

    fn try_from(row: ColumnRow) -> Result<Self> {
        let column_type = ColumnType::try_from(row.column_type).map_err(|e| Error::External {
            source: Box::new(e),
        })?;
        Ok(Self::new(row.column_name, column_type))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PartitionRow {
    tenant_id: String,
    table_name: String,
    partition_name: String,
    size_bytes: i64,
    start_time: i64,
    end_time: i64,
    columns: Json<Vec<Column>>,
}

impl From<PartitionRow> for Partition {
    fn from(row: PartitionRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            table_name: row.table_name,
            name: row.partition_name,
            size_bytes: row.size_bytes,
            time_range: TimeRange::new(row.start_time, row.end_time),
            columns: row.columns.0,
        }
    }
}

/// Creates a new [`sqlx::Pool`] from a database config.
async fn new_pool(options: &PostgresConnectionOptions) -> Result<PgPool, sqlx::Error> {
    // sqlx exposes some options as pool options, while other options are available as connection options.
    let connect_options = PgConnectOptions::from_str(&options.dsn)?
        // the default is INFO, which is frankly surprising.
        .log_statements(LevelFilter::Trace);

    let app_name = options.app_name.clone();
    let schema_name = options.schema_name.clone();
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(options.max_conns)
        .acquire_timeout(options.connect_timeout)
        .idle_timeout(options.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            let app_name = app_name.clone();
            let schema_name = schema_name.clone();
            Box::pin(async move {
                // Tag the connection with the provided application name, while allowing it to
                // be overridden from the connection string (aka DSN).
                let current_application_name: String =
                    sqlx::query_scalar("SELECT current_setting('application_name');")
                        .fetch_one(&mut *c)
                        .await?;
                if current_application_name.is_empty() {
                    sqlx::query("SELECT set_config('application_name', $1, false);")
                        .bind(&*app_name)
                        .execute(&mut *c)
                        .await?;
                }
                let search_path_query = format!("SET search_path TO {schema_name},public;");
                c.execute(sqlx::query(&search_path_query)).await?;

                // Ensure explicit timezone selection, instead of deferring to
                // the server value.
                c.execute("SET timezone = 'UTC';").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    // Log a connection was successfully established and include the application
    // name for cross-correlation between logs & database connections.
    info!(application_name=%options.app_name, "connected to catalog store");

    Ok(pool)
}

/// The error code returned by Postgres for a unique constraint violation.
///
/// See <https://www.postgresql.org/docs/9.2/errcodes-appendix.html>
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Error codes returned by Postgres when a transaction lost against a concurrent one and may
/// succeed when re-run: `serialization_failure` and `deadlock_detected`.
const PG_TRANSIENT: [&str; 2] = ["40001", "40P01"];

/// Returns true if `e` is a unique constraint violation error.
fn is_unique_violation(e: &sqlx::Error) -> bool {
    database_error_code(e).is_some_and(|code| code == PG_UNIQUE_VIOLATION)
}

fn is_transient(e: &sqlx::Error) -> bool {
    database_error_code(e).is_some_and(|code| PG_TRANSIENT.contains(&code.as_str()))
}

fn database_error_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(inner) => inner.code().map(|c| c.into_owned()),
        _ => None,
    }
}
