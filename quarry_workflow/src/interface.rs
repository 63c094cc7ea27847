//! Types, traits and error types of the workflow run store.

use std::{
    fmt::{Debug, Display},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_types::{IngestRequest, Partition, WorkflowId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("run {run_id} is not owned by {owner}")]
    LostOwnership { run_id: RunId, owner: String },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("{0} is not a terminal run status")]
    NotTerminal(RunStatus),

    #[error("invalid worker configuration: {0}")]
    Config(String),

    #[error("workflow store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(Box::new(e))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Store(Box::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Opaque identity of one run, assigned when the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// A new, time ordered run id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Lifecycle status of a run as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a new run may be started for a workflow whose latest run has this status.
    pub fn allows_duplicate(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Canceled)
    }

    /// The state a run closed with this status ends in.
    fn terminal_state(&self) -> Option<IngestState> {
        match self {
            Self::Running => None,
            Self::Completed => Some(IngestState::Completed),
            Self::Failed | Self::TimedOut => Some(IngestState::Failed),
            Self::Canceled => Some(IngestState::Canceled),
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "timed_out" => Self::TimedOut,
            "canceled" => Self::Canceled,
            _ => return Err(format!("unknown run status: {s}")),
        })
    }
}

/// Position of a run in the ingest state machine.
///
/// ```text
/// Started -> Transforming -> Recording -> Completed
///                 |              |
///                 +--> Failed <--+
/// ```
///
/// `Canceled` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Started,
    Transforming,
    Recording,
    Completed,
    Failed,
    Canceled,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Transforming => "transforming",
            Self::Recording => "recording",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "started" => Self::Started,
            "transforming" => Self::Transforming,
            "recording" => Self::Recording,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => return Err(format!("unknown ingest state: {s}")),
        })
    }
}

/// One durable execution of the ingest workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub state: IngestState,
    pub request: IngestRequest,
    /// Delivery id of the notification that started the run.
    pub idempotency_token: String,
    /// Output of the transform step, once committed.
    pub partition: Option<Partition>,
    pub failure: Option<String>,
    pub cancel_requested: bool,
    /// Worker currently holding the claim on the run.
    pub owner: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh run of the workflow identified by `request`.
    pub fn new(request: IngestRequest, idempotency_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: request.workflow_id(),
            run_id: RunId::new(),
            status: RunStatus::Running,
            state: IngestState::Started,
            request,
            idempotency_token: idempotency_token.into(),
            partition: None,
            failure: None,
            cancel_requested: false,
            owner: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of [`WorkflowStore::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new run was created.
    Started(WorkflowRun),
    /// The workflow already has a running or completed run, which is returned instead.
    Existing(WorkflowRun),
}

impl StartOutcome {
    pub fn run(&self) -> &WorkflowRun {
        match self {
            Self::Started(run) | Self::Existing(run) => run,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// Durable storage of workflow runs.
///
/// Every mutation of a claimed run is fenced on the claiming worker: a worker that lost its claim
/// gets [`Error::LostOwnership`].
#[async_trait]
pub trait WorkflowStore: Send + Sync + Debug + Display {
    /// Setup the store for usage and apply possible migrations.
    async fn setup(&self) -> Result<()>;

    /// Start a run for `request` unless the workflow's latest run is running or completed, in
    /// which case that run is returned.
    async fn start(&self, request: IngestRequest, idempotency_token: &str)
        -> Result<StartOutcome>;

    /// Claim one running run that is unowned or whose owner has not sent a heartbeat within
    /// `stale_after`.
    async fn claim(&self, owner: &str, stale_after: Duration) -> Result<Option<WorkflowRun>>;

    /// Record liveness of a claimed run. Returns whether cancellation was requested.
    async fn heartbeat(&self, run_id: RunId, owner: &str) -> Result<bool>;

    /// Move a claimed run to a non-terminal state.
    async fn enter_state(&self, run_id: RunId, owner: &str, state: IngestState) -> Result<()>;

    /// Commit the output of the transform step and move the run to
    /// [`IngestState::Recording`].
    async fn commit_transform(&self, run_id: RunId, owner: &str, partition: &Partition)
        -> Result<()>;

    /// Close a claimed run as completed.
    async fn complete(&self, run_id: RunId, owner: &str) -> Result<()>;

    /// Close a claimed run with a terminal, non-successful status.
    async fn close(
        &self,
        run_id: RunId,
        owner: &str,
        status: RunStatus,
        failure: Option<String>,
    ) -> Result<()>;

    /// Give up the claim on a run without changing its state, so that another worker resumes it.
    async fn release(&self, run_id: RunId, owner: &str) -> Result<()>;

    /// Request cancellation of the workflow's running run.
    ///
    /// A run nobody holds a claim on is canceled right away, a claimed run is flagged and
    /// interrupted by its worker. The latest run is returned; it is unchanged if it already
    /// finished.
    async fn request_cancel(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun>;

    /// The latest run of the workflow.
    async fn describe(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun>;

    /// Release any connections held by the store.
    async fn shutdown(&self) {}
}

pub(crate) fn closed_state(status: RunStatus) -> Result<IngestState> {
    status.terminal_state().ok_or(Error::NotTerminal(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::TimedOut,
            RunStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn reuse_policy() {
        assert!(!RunStatus::Running.allows_duplicate());
        assert!(!RunStatus::Completed.allows_duplicate());
        assert!(RunStatus::Failed.allows_duplicate());
        assert!(RunStatus::TimedOut.allows_duplicate());
        assert!(RunStatus::Canceled.allows_duplicate());
    }

    #[test]
    fn closed_states() {
        assert_eq!(closed_state(RunStatus::Failed).unwrap(), IngestState::Failed);
        assert_eq!(closed_state(RunStatus::TimedOut).unwrap(), IngestState::Failed);
        assert_eq!(
            closed_state(RunStatus::Canceled).unwrap(),
            IngestState::Canceled
        );
        assert!(matches!(
            closed_state(RunStatus::Running),
            Err(Error::NotTerminal(RunStatus::Running))
        ));
    }
}
