//! A Postgres backed run store.

use std::{fmt::Display, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_catalog::postgres::PostgresConnectionOptions;
use quarry_types::{IngestRequest, Partition, WorkflowId};
use sqlx::{
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
    ConnectOptions, Executor, PgPool,
};
use tracing::{debug, info, log::LevelFilter};
use uuid::Uuid;

use crate::interface::{
    closed_state, Error, IngestState, Result, RunId, RunStatus, StartOutcome, WorkflowRun,
    WorkflowStore,
};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Default schema of the run store.
pub const DEFAULT_SCHEMA_NAME: &str = "quarry_workflow";

const RUN_COLUMNS: &str = "run_id, workflow_id, status, state, request, idempotency_token, \
    partition, failure, cancel_requested, owner, heartbeat_at, created_at, updated_at";

#[derive(Debug)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
    options: PostgresConnectionOptions,
}

impl PostgresWorkflowStore {
    /// Connect to the run store. The connection options are shared with the catalog; only the
    /// schema differs.
    pub async fn connect(options: PostgresConnectionOptions) -> Result<Self> {
        let pool = new_pool(&options).await?;
        Ok(Self { pool, options })
    }

    fn schema_name(&self) -> &str {
        &self.options.schema_name
    }

    async fn latest(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
SELECT {RUN_COLUMNS}
FROM workflow_runs
WHERE workflow_id = $1
ORDER BY created_at DESC, run_id DESC
LIMIT 1;
            "#
        ))
        .bind(workflow_id.as_str()) // $1
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    /// Apply a fenced update to a claimed run, failing with [`Error::LostOwnership`] when the run
    /// is no longer running or claimed by someone else.
    fn fenced(run_id: RunId, owner: &str, rows_affected: u64) -> Result<()> {
        if rows_affected == 0 {
            debug!(%run_id, owner, "fenced update rejected");
            return Err(Error::LostOwnership {
                run_id,
                owner: owner.to_owned(),
            });
        }
        Ok(())
    }
}

impl Display for PostgresWorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not include ANY credentials or secrets in the output
        write!(
            f,
            "Postgres(schema={}, max_conns={})",
            self.options.schema_name, self.options.max_conns
        )
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn setup(&self) -> Result<()> {
        // The schema must exist before the migrations run, so that the migrations table lands in
        // it rather than in `public`.
        let create_schema_query = format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema_name());
        self.pool.execute(sqlx::query(&create_schema_query)).await?;

        MIGRATOR.run(&self.pool).await?;
        info!(schema_name = self.schema_name(), "workflow store migrations applied");

        Ok(())
    }

    async fn start(
        &self,
        request: IngestRequest,
        idempotency_token: &str,
    ) -> Result<StartOutcome> {
        let workflow_id = request.workflow_id();
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent starts of the same workflow.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1));")
            .bind(workflow_id.as_str()) // $1
            .execute(&mut *tx)
            .await?;

        let latest = sqlx::query_as::<_, RunRow>(&format!(
            r#"
SELECT {RUN_COLUMNS}
FROM workflow_runs
WHERE workflow_id = $1
ORDER BY created_at DESC, run_id DESC
LIMIT 1;
            "#
        ))
        .bind(workflow_id.as_str()) // $1
        .fetch_optional(&mut *tx)
        .await?
        .map(WorkflowRun::try_from)
        .transpose()?;

        if let Some(run) = latest {
            if !run.status.allows_duplicate() {
                debug!(%workflow_id, run_id=%run.run_id, status=%run.status, "deduplicated start");
                return Ok(StartOutcome::Existing(run));
            }
        }

        let run = sqlx::query_as::<_, RunRow>(&format!(
            r#"
INSERT INTO workflow_runs
    ( run_id, workflow_id, status, state, request, idempotency_token )
VALUES
    ( $1, $2, $3, $4, $5, $6 )
RETURNING {RUN_COLUMNS};
            "#
        ))
        .bind(RunId::new().get()) // $1
        .bind(workflow_id.as_str()) // $2
        .bind(RunStatus::Running.as_str()) // $3
        .bind(IngestState::Started.as_str()) // $4
        .bind(Json(&request)) // $5
        .bind(idempotency_token) // $6
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(StartOutcome::Started(WorkflowRun::try_from(run)?))
    }

    async fn claim(&self, owner: &str, stale_after: Duration) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
UPDATE workflow_runs
SET owner = $1, heartbeat_at = now(), updated_at = now()
WHERE run_id = (
    SELECT run_id
    FROM workflow_runs
    WHERE status = 'running'
      AND (owner IS NULL
           OR heartbeat_at IS NULL
           OR heartbeat_at < now() - make_interval(secs => $2))
    ORDER BY created_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING {RUN_COLUMNS};
            "#
        ))
        .bind(owner) // $1
        .bind(stale_after.as_secs_f64()) // $2
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    async fn heartbeat(&self, run_id: RunId, owner: &str) -> Result<bool> {
        let cancel_requested: Option<bool> = sqlx::query_scalar(
            r#"
UPDATE workflow_runs
SET heartbeat_at = now()
WHERE run_id = $1 AND owner = $2 AND status = 'running'
RETURNING cancel_requested;
            "#,
        )
        .bind(run_id.get()) // $1
        .bind(owner) // $2
        .fetch_optional(&self.pool)
        .await?;

        cancel_requested.ok_or_else(|| Error::LostOwnership {
            run_id,
            owner: owner.to_owned(),
        })
    }

    async fn enter_state(&self, run_id: RunId, owner: &str, state: IngestState) -> Result<()> {
        let res = sqlx::query(
            r#"
UPDATE workflow_runs
SET state = $3, updated_at = now()
WHERE run_id = $1 AND owner = $2 AND status = 'running';
            "#,
        )
        .bind(run_id.get()) // $1
        .bind(owner) // $2
        .bind(state.as_str()) // $3
        .execute(&self.pool)
        .await?;

        Self::fenced(run_id, owner, res.rows_affected())
    }

    async fn commit_transform(
        &self,
        run_id: RunId,
        owner: &str,
        partition: &Partition,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
UPDATE workflow_runs
SET partition = $3, state = $4, updated_at = now()
WHERE run_id = $1 AND owner = $2 AND status = 'running';
            "#,
        )
        .bind(run_id.get()) // $1
        .bind(owner) // $2
        .bind(Json(partition)) // $3
        .bind(IngestState::Recording.as_str()) // $4
        .execute(&self.pool)
        .await?;

        Self::fenced(run_id, owner, res.rows_affected())
    }

    async fn complete(&self, run_id: RunId, owner: &str) -> Result<()> {
        self.close(run_id, owner, RunStatus::Completed, None).await
    }

    async fn close(
        &self,
        run_id: RunId,
        owner: &str,
        status: RunStatus,
        failure: Option<String>,
    ) -> Result<()> {
        let state = closed_state(status)?;
        let res = sqlx::query(
            r#"
UPDATE workflow_runs
SET status = $3, state = $4, failure = $5, owner = NULL, updated_at = now()
WHERE run_id = $1 AND owner = $2 AND status = 'running';
            "#,
        )
        .bind(run_id.get()) // $1
        .bind(owner) // $2
        .bind(status.as_str()) // $3
        .bind(state.as_str()) // $4
        .bind(failure) // $5
        .execute(&self.pool)
        .await?;

        Self::fenced(run_id, owner, res.rows_affected())
    }

    async fn release(&self, run_id: RunId, owner: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
UPDATE workflow_runs
SET owner = NULL, heartbeat_at = NULL, updated_at = now()
WHERE run_id = $1 AND owner = $2 AND status = 'running';
            "#,
        )
        .bind(run_id.get()) // $1
        .bind(owner) // $2
        .execute(&self.pool)
        .await?;

        Self::fenced(run_id, owner, res.rows_affected())
    }

    async fn request_cancel(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun> {
        // Unclaimed runs are closed right away, claimed ones are flagged for their worker.
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
UPDATE workflow_runs
SET cancel_requested = TRUE,
    status = CASE WHEN owner IS NULL THEN 'canceled' ELSE status END,
    state = CASE WHEN owner IS NULL THEN 'canceled' ELSE state END,
    updated_at = now()
WHERE workflow_id = $1 AND status = 'running'
RETURNING {RUN_COLUMNS};
            "#
        ))
        .bind(workflow_id.as_str()) // $1
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => WorkflowRun::try_from(row),
            None => self
                .latest(workflow_id)
                .await?
                .ok_or_else(|| Error::WorkflowNotFound(workflow_id.clone())),
        }
    }

    async fn describe(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun> {
        self.latest(workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.clone()))
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    workflow_id: String,
    status: String,
    state: String,
    request: Json<IngestRequest>,
    idempotency_token: String,
    partition: Option<Json<Partition>>,
    failure: Option<String>,
    cancel_requested: bool,
    owner: Option<String>,
    heartbeat_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            workflow_id: WorkflowId::from_raw(row.workflow_id),
            run_id: RunId::from(row.run_id),
            status: row.status.parse().map_err(|e: String| Error::Store(e.into()))?,
            state: row.state.parse().map_err(|e: String| Error::Store(e.into()))?,
            request: row.request.0,
            idempotency_token: row.idempotency_token,
            partition: row.partition.map(|p| p.0),
            failure: row.failure,
            cancel_requested: row.cancel_requested,
            owner: row.owner,
            heartbeat_at: row.heartbeat_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

async fn new_pool(options: &PostgresConnectionOptions) -> Result<PgPool, sqlx::Error> {
    let connect_options = options
        .dsn
        .parse::<PgConnectOptions>()?
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
                c.execute("SET timezone = 'UTC';").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    info!(application_name=%options.app_name, "connected to workflow store");

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_test_helpers::maybe_skip_integration;

    use super::*;

    async fn setup_db(dsn: &str) -> PostgresWorkflowStore {
        let options = PostgresConnectionOptions {
            app_name: String::from("test"),
            schema_name: quarry_test_helpers::random_schema_name(),
            dsn: dsn.to_owned(),
            max_conns: 5,
            ..Default::default()
        };
        let store = PostgresWorkflowStore::connect(options)
            .await
            .expect("failed to connect workflow store");
        store.setup().await.expect("failed to initialise database");
        store
    }

    #[test_log::test(tokio::test)]
    async fn test_workflow_store() {
        let dsn = maybe_skip_integration!();

        crate::interface_tests::test_workflow_store(|| {
            let dsn = dsn.clone();
            async move { Arc::new(setup_db(&dsn).await) as Arc<dyn WorkflowStore> }
        })
        .await;
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_starts_create_one_run() {
        let dsn = maybe_skip_integration!();

        let store = Arc::new(setup_db(&dsn).await);
        let request = crate::interface_tests::arbitrary_request("part-001.json");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let request = request.clone();
                tokio::spawn(async move { store.start(request, &format!("msg-{i}")).await })
            })
            .collect();

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_started() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }
}
