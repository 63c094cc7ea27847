//! Configs of the store holding workflow runs.
use std::sync::Arc;

use quarry_catalog::postgres::PostgresConnectionOptions;
use quarry_workflow::{
    interface::WorkflowStore,
    mem::MemWorkflowStore,
    postgres::{PostgresWorkflowStore, DEFAULT_SCHEMA_NAME},
};
use snafu::{ResultExt, Snafu};
use tracing::info;

fn default_max_connections() -> &'static str {
    let s = PostgresConnectionOptions::DEFAULT_MAX_CONNS.to_string();
    Box::leak(Box::new(s))
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Unknown workflow store DSN {dsn}. Expected a string like 'postgresql://postgres@localhost:5432/postgres' or 'memory'"))]
    UnknownWorkflowDsn { dsn: String },

    #[snafu(display("Workflow store DSN not specified. Expected a string like 'postgresql://postgres@localhost:5432/postgres' or 'memory'"))]
    WorkflowDsnNotSpecified {},

    #[snafu(display("A workflow store error occurred: {}", source))]
    Store {
        source: quarry_workflow::interface::Error,
    },
}

/// CLI config for the workflow run store.
#[derive(Debug, Clone, Default, clap::Parser)]
pub struct WorkflowStoreConfig {
    /// Workflow store connection string.
    ///
    /// PostgreSQL: `postgresql://postgres@localhost:5432/postgres`
    ///
    /// Memory (ephemeral, runs are lost on exit): `memory`
    #[clap(id = "workflow_dsn", long = "workflow-dsn", env = "QUARRY_WORKFLOW_DSN", action)]
    pub dsn: Option<String>,

    /// Schema name of a PostgreSQL-based workflow store.
    #[clap(
        id = "workflow_postgres_schema_name",
        long = "workflow-postgres-schema-name",
        env = "QUARRY_WORKFLOW_POSTGRES_SCHEMA_NAME",
        default_value = DEFAULT_SCHEMA_NAME,
        action,
    )]
    pub postgres_schema_name: String,

    /// Maximum number of connections allowed to the workflow store at any one time.
    #[clap(
        long = "workflow-max-connections",
        env = "QUARRY_WORKFLOW_MAX_CONNECTIONS",
        default_value = default_max_connections(),
        action,
    )]
    pub max_connections: u32,
}

impl WorkflowStoreConfig {
    /// Get config-dependent run store.
    ///
    /// The store is not set up; call [`WorkflowStore::setup`] before using it.
    pub async fn get_store(&self, app_name: &'static str) -> Result<Arc<dyn WorkflowStore>, Error> {
        let Some(dsn) = self.dsn.as_ref() else {
            return Err(Error::WorkflowDsnNotSpecified {});
        };

        if dsn.starts_with("postgres") {
            // do not log entire postgres dsn as it may contain credentials
            info!(postgres_schema_name=%self.postgres_schema_name, "Workflow store: Postgres");
            let options = PostgresConnectionOptions {
                app_name: app_name.to_owned(),
                schema_name: self.postgres_schema_name.clone(),
                dsn: dsn.to_owned(),
                max_conns: self.max_connections,
                connect_timeout: PostgresConnectionOptions::DEFAULT_CONNECT_TIMEOUT,
                idle_timeout: PostgresConnectionOptions::DEFAULT_IDLE_TIMEOUT,
            };
            Ok(Arc::new(
                PostgresWorkflowStore::connect(options)
                    .await
                    .context(StoreSnafu)?,
            ))
        } else if dsn == "memory" {
            info!("Workflow store: In-memory");
            Ok(Arc::new(MemWorkflowStore::new()))
        } else {
            Err(Error::UnknownWorkflowDsn {
                dsn: dsn.to_string(),
            })
        }
    }
}
