//! In-memory run store for tests and single process deployments.

use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use quarry_types::{IngestRequest, Partition, WorkflowId};
use tracing::debug;

use crate::interface::{
    closed_state, Error, IngestState, Result, RunId, RunStatus, StartOutcome, WorkflowRun,
    WorkflowStore,
};

#[derive(Debug, Default)]
pub struct MemWorkflowStore {
    /// All runs, in start order.
    runs: Mutex<Vec<WorkflowRun>>,
}

impl MemWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for MemWorkflowStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

fn latest<'a>(runs: &'a mut [WorkflowRun], workflow_id: &WorkflowId) -> Option<&'a mut WorkflowRun> {
    runs.iter_mut().rev().find(|r| &r.workflow_id == workflow_id)
}

/// The running run `run_id` if `owner` holds its claim.
fn owned<'a>(runs: &'a mut [WorkflowRun], run_id: RunId, owner: &str) -> Result<&'a mut WorkflowRun> {
    runs.iter_mut()
        .find(|r| {
            r.run_id == run_id && r.status == RunStatus::Running && r.owner.as_deref() == Some(owner)
        })
        .ok_or_else(|| Error::LostOwnership {
            run_id,
            owner: owner.to_owned(),
        })
}

#[async_trait]
impl WorkflowStore for MemWorkflowStore {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn start(
        &self,
        request: IngestRequest,
        idempotency_token: &str,
    ) -> Result<StartOutcome> {
        let mut runs = self.runs.lock();
        let workflow_id = request.workflow_id();

        if let Some(run) = latest(&mut runs, &workflow_id) {
            if !run.status.allows_duplicate() {
                debug!(%workflow_id, run_id=%run.run_id, status=%run.status, "deduplicated start");
                return Ok(StartOutcome::Existing(run.clone()));
            }
        }

        let run = WorkflowRun::new(request, idempotency_token);
        runs.push(run.clone());
        Ok(StartOutcome::Started(run))
    }

    async fn claim(&self, owner: &str, stale_after: Duration) -> Result<Option<WorkflowRun>> {
        let mut runs = self.runs.lock();
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d));

        let claimable = runs.iter_mut().find(|r| {
            r.status == RunStatus::Running
                && match (&r.owner, r.heartbeat_at, stale_before) {
                    (None, _, _) => true,
                    (Some(_), Some(beat), Some(stale_before)) => beat < stale_before,
                    (Some(_), None, _) => true,
                    (Some(_), Some(_), None) => false,
                }
        });

        Ok(claimable.map(|run| {
            run.owner = Some(owner.to_owned());
            run.heartbeat_at = Some(now);
            run.updated_at = now;
            run.clone()
        }))
    }

    async fn heartbeat(&self, run_id: RunId, owner: &str) -> Result<bool> {
        let mut runs = self.runs.lock();
        let run = owned(&mut runs, run_id, owner)?;
        run.heartbeat_at = Some(Utc::now());
        Ok(run.cancel_requested)
    }

    async fn enter_state(&self, run_id: RunId, owner: &str, state: IngestState) -> Result<()> {
        let mut runs = self.runs.lock();
        let run = owned(&mut runs, run_id, owner)?;
        run.state = state;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_transform(
        &self,
        run_id: RunId,
        owner: &str,
        partition: &Partition,
    ) -> Result<()> {
        let mut runs = self.runs.lock();
        let run = owned(&mut runs, run_id, owner)?;
        run.partition = Some(partition.clone());
        run.state = IngestState::Recording;
        run.updated_at = Utc::now();
        Ok(())
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
        let mut runs = self.runs.lock();
        let run = owned(&mut runs, run_id, owner)?;
        run.status = status;
        run.state = state;
        run.failure = failure;
        run.owner = None;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn release(&self, run_id: RunId, owner: &str) -> Result<()> {
        let mut runs = self.runs.lock();
        let run = owned(&mut runs, run_id, owner)?;
        run.owner = None;
        run.heartbeat_at = None;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun> {
        let mut runs = self.runs.lock();
        let run = latest(&mut runs, workflow_id)
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.clone()))?;

        if run.status == RunStatus::Running {
            run.cancel_requested = true;
            if run.owner.is_none() {
                run.status = RunStatus::Canceled;
                run.state = IngestState::Canceled;
            }
            run.updated_at = Utc::now();
        }
        Ok(run.clone())
    }

    async fn describe(&self, workflow_id: &WorkflowId) -> Result<WorkflowRun> {
        let mut runs = self.runs.lock();
        latest(&mut runs, workflow_id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.clone()))
    }
}
