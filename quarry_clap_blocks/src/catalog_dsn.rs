//! Catalog-DSN-related configs.
use std::{sync::Arc, time::Duration};

use quarry_catalog::{
    interface::Catalog,
    mem::MemCatalog,
    postgres::{PostgresCatalog, PostgresConnectionOptions},
    retry::RetryConfig,
};
use service_grpc_catalog::GrpcCatalogClient;
use snafu::{ResultExt, Snafu};
use tracing::info;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Unknown Catalog DSN {dsn}. Expected a string like 'postgresql://postgres@localhost:5432/postgres', 'http://catalog:8082' or 'memory'"))]
    UnknownCatalogDsn { dsn: String },

    #[snafu(display("Catalog DSN not specified. Expected a string like 'postgresql://postgres@localhost:5432/postgres', 'http://catalog:8082' or 'memory'"))]
    DsnNotSpecified {},

    #[snafu(display("Invalid catalog service address {dsn}: {descr}"))]
    InvalidServiceAddress { dsn: String, descr: String },

    #[snafu(display("A catalog error occurred: {}", source))]
    Catalog {
        source: quarry_catalog::interface::Error,
    },
}

pub(crate) fn leak_duration(d: Duration) -> &'static str {
    let s = humantime::format_duration(d).to_string();
    Box::leak(Box::new(s))
}

fn default_max_connections() -> &'static str {
    let s = PostgresConnectionOptions::DEFAULT_MAX_CONNS.to_string();
    Box::leak(Box::new(s))
}

fn default_connect_timeout() -> &'static str {
    leak_duration(PostgresConnectionOptions::DEFAULT_CONNECT_TIMEOUT)
}

fn default_idle_timeout() -> &'static str {
    leak_duration(PostgresConnectionOptions::DEFAULT_IDLE_TIMEOUT)
}

fn default_request_timeout() -> &'static str {
    leak_duration(GrpcCatalogClient::DEFAULT_REQUEST_TIMEOUT)
}

fn default_max_attempts() -> &'static str {
    let s = RetryConfig::DEFAULT_MAX_ATTEMPTS.to_string();
    Box::leak(Box::new(s))
}

/// CLI config for catalog DSN.
#[derive(Debug, Clone, Default, clap::Parser)]
pub struct CatalogDsnConfig {
    /// Catalog connection string.
    ///
    /// The dsn determines the type of catalog used.
    ///
    /// PostgreSQL: `postgresql://postgres@localhost:5432/postgres`
    ///
    /// Remote catalog service: `http://catalog:8082`
    ///
    /// Memory (ephemeral, only useful for testing): `memory`
    ///
    #[clap(long = "catalog-dsn", env = "QUARRY_CATALOG_DSN", action)]
    pub dsn: Option<String>,

    /// Maximum number of connections allowed to the catalog at any one time.
    #[clap(
        long = "catalog-max-connections",
        env = "QUARRY_CATALOG_MAX_CONNECTIONS",
        default_value = default_max_connections(),
        action,
    )]
    pub max_catalog_connections: u32,

    /// Schema name for PostgreSQL-based catalogs.
    #[clap(
        long = "catalog-postgres-schema-name",
        env = "QUARRY_CATALOG_POSTGRES_SCHEMA_NAME",
        default_value = PostgresConnectionOptions::DEFAULT_SCHEMA_NAME,
        action,
    )]
    pub postgres_schema_name: String,

    /// Set the amount of time to attempt connecting to the database.
    #[clap(
        long = "catalog-connect-timeout",
        env = "QUARRY_CATALOG_CONNECT_TIMEOUT",
        default_value = default_connect_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    #[clap(
        long = "catalog-idle-timeout",
        env = "QUARRY_CATALOG_IDLE_TIMEOUT",
        default_value = default_idle_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub idle_timeout: Duration,

    /// Number of attempts of a partition insert that loses against a concurrent transaction.
    #[clap(
        long = "catalog-max-attempts",
        env = "QUARRY_CATALOG_MAX_ATTEMPTS",
        default_value = default_max_attempts(),
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub max_attempts: u32,

    /// Timeout of requests to a remote catalog service.
    #[clap(
        long = "catalog-request-timeout",
        env = "QUARRY_CATALOG_REQUEST_TIMEOUT",
        default_value = default_request_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub request_timeout: Duration,
}

impl CatalogDsnConfig {
    /// Postgres connection options for the given DSN.
    pub fn postgres_options(&self, app_name: &str, dsn: &str) -> PostgresConnectionOptions {
        PostgresConnectionOptions {
            app_name: app_name.to_owned(),
            schema_name: self.postgres_schema_name.clone(),
            dsn: dsn.to_owned(),
            max_conns: self.max_catalog_connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Get config-dependent catalog.
    pub async fn get_catalog(&self, app_name: &'static str) -> Result<Arc<dyn Catalog>, Error> {
        let Some(dsn) = self.dsn.as_ref() else {
            return Err(Error::DsnNotSpecified {});
        };

        if dsn.starts_with("postgres") {
            // do not log entire postgres dsn as it may contain credentials
            info!(postgres_schema_name=%self.postgres_schema_name, "Catalog: Postgres");
            let retry = RetryConfig {
                max_attempts: self.max_attempts,
                ..Default::default()
            };
            Ok(Arc::new(
                PostgresCatalog::connect(self.postgres_options(app_name, dsn), retry)
                    .await
                    .context(CatalogSnafu)?,
            ))
        } else if dsn.starts_with("http://") || dsn.starts_with("https://") {
            let uri = dsn
                .parse::<tonic::transport::Uri>()
                .map_err(|e| Error::InvalidServiceAddress {
                    dsn: dsn.clone(),
                    descr: e.to_string(),
                })?;
            info!(%uri, "Catalog: remote service");
            Ok(Arc::new(GrpcCatalogClient::new(uri, self.request_timeout)))
        } else if dsn == "memory" {
            info!("Catalog: In-memory");
            Ok(Arc::new(MemCatalog::new()))
        } else {
            Err(Error::UnknownCatalogDsn {
                dsn: dsn.to_string(),
            })
        }
    }
}
