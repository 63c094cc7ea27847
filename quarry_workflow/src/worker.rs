//! Executes claimed workflow runs.
//!
//! A worker polls the [`WorkflowStore`] for runs, claims them and drives each through the ingest
//! state machine, resuming from whatever state the run committed last. The transform step is
//! supervised: it runs under a step deadline and a heartbeat watchdog, its heartbeats are forwarded
//! to the store, and it is interrupted when cancellation is requested or the worker shuts down.

use std::{sync::Arc, time::Duration};

use quarry_catalog::interface::Error as CatalogError;
use quarry_transform::Heartbeat;
use quarry_types::Partition;
use tokio::{
    sync::{watch, Semaphore},
    time::{sleep_until, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    activity::{ActivityError, IngestActivities},
    interface::{Error, IngestState, Result, RunId, RunStatus, WorkflowRun, WorkflowStore},
};

/// Configuration of an [`IngestWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity the worker claims runs under. Must be unique among live workers.
    pub worker_id: String,

    /// Maximum number of runs executed at the same time.
    pub concurrency: usize,

    /// Delay between polls when no run is claimable.
    pub poll_interval: Duration,

    /// Deadline of one transform attempt.
    pub step_timeout: Duration,

    /// Longest tolerated gap between two heartbeats of the transform step.
    pub heartbeat_timeout: Duration,

    /// Interval the transform step heartbeats at.
    pub heartbeat_interval: Duration,

    /// Deadline of the catalog call.
    pub record_timeout: Duration,

    /// Age of the last heartbeat after which a claimed run is considered abandoned.
    pub stale_after: Duration,
}

impl WorkerConfig {
    pub const DEFAULT_CONCURRENCY: usize = 4;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(6 * 60);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2 * 60);

    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrency: Self::DEFAULT_CONCURRENCY,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            step_timeout: Self::DEFAULT_STEP_TIMEOUT,
            heartbeat_timeout: Self::DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            record_timeout: Self::DEFAULT_RECORD_TIMEOUT,
            stale_after: Self::DEFAULT_STALE_AFTER,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(Error::Config("worker id must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.heartbeat_interval.saturating_mul(2) > self.heartbeat_timeout {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be at most half the heartbeat timeout {:?}",
                self.heartbeat_interval, self.heartbeat_timeout
            )));
        }
        if self.stale_after <= self.heartbeat_timeout || self.stale_after <= self.record_timeout {
            return Err(Error::Config(format!(
                "stale claim age {:?} must exceed the heartbeat timeout {:?} and the record timeout {:?}",
                self.stale_after, self.heartbeat_timeout, self.record_timeout
            )));
        }
        Ok(())
    }
}

/// How the worker left a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run reached the given terminal status.
    Closed(RunStatus),
    /// The claim was given up, another worker resumes the run.
    Released,
    /// Another worker took over the run.
    LostOwnership,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Activity(ActivityError),

    #[error("transform step timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("no heartbeat from transform step within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("canceled on request")]
    CancelRequested,

    #[error("worker shutting down")]
    Shutdown,

    #[error("lost claim on run")]
    LostOwnership,
}

impl StepError {
    fn status(&self) -> RunStatus {
        match self {
            Self::StepTimeout(_) | Self::HeartbeatTimeout(_) => RunStatus::TimedOut,
            Self::CancelRequested => RunStatus::Canceled,
            Self::Activity(_) | Self::Shutdown | Self::LostOwnership => RunStatus::Failed,
        }
    }
}

/// Forwards transform heartbeats to the step's watchdog.
#[derive(Debug)]
struct StepHeartbeat {
    beats: watch::Sender<Instant>,
}

impl Heartbeat for StepHeartbeat {
    fn heartbeat(&self) {
        self.beats.send_replace(Instant::now());
    }
}

#[derive(Debug)]
pub struct IngestWorker {
    config: WorkerConfig,
    store: Arc<dyn WorkflowStore>,
    activities: Arc<dyn IngestActivities>,
}

impl IngestWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn WorkflowStore>,
        activities: Arc<dyn IngestActivities>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            activities,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn owner(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and execute runs until `shutdown` fires.
    ///
    /// On shutdown no new run is claimed; runs in their transform step are interrupted and
    /// released, and this returns once every in-flight run has been left.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let tasks = TaskTracker::new();
        info!(
            worker_id = self.owner(),
            concurrency = self.config.concurrency,
            store = %self.store,
            "worker started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Not raced against shutdown: a claim committed by the store must reach a task.
            let claimed = self
                .store
                .claim(self.owner(), self.config.stale_after)
                .await;

            match claimed {
                Ok(Some(run)) => {
                    let this = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        this.execute(run, &shutdown).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(%e, "failed to claim workflow run"),
            }
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tasks.close();
        info!(in_flight = tasks.len(), "worker stopping");
        tasks.wait().await;
        info!(worker_id = self.owner(), "worker stopped");
    }

    /// Claim at most one run and execute it to the end.
    pub async fn poll_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<(RunId, RunOutcome)>> {
        let Some(run) = self
            .store
            .claim(self.owner(), self.config.stale_after)
            .await?
        else {
            return Ok(None);
        };
        let run_id = run.run_id;
        Ok(Some((run_id, self.execute(run, shutdown).await)))
    }

    async fn execute(&self, run: WorkflowRun, shutdown: &CancellationToken) -> RunOutcome {
        let span = info_span!(
            "ingest_run",
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
        );
        async move {
            info!(state = %run.state, "executing run");
            match self.drive(&run, shutdown).await {
                Ok(outcome) => {
                    info!(?outcome, "left run");
                    outcome
                }
                Err(Error::LostOwnership { .. }) => {
                    warn!("lost claim on run");
                    RunOutcome::LostOwnership
                }
                Err(e) => {
                    error!(%e, "workflow store failed, releasing run");
                    if let Err(e) = self.store.release(run.run_id, self.owner()).await {
                        warn!(%e, "failed to release run");
                    }
                    RunOutcome::Released
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, run: &WorkflowRun, shutdown: &CancellationToken) -> Result<RunOutcome> {
        let run_id = run.run_id;
        let owner = self.owner();

        if run.cancel_requested {
            return self
                .close(run_id, RunStatus::Canceled, "canceled on request".into())
                .await;
        }

        let resumed = run.state == IngestState::Recording;
        let partition = match run.state {
            IngestState::Started | IngestState::Transforming => {
                self.store
                    .enter_state(run_id, owner, IngestState::Transforming)
                    .await?;

                match self.transform_step(run, shutdown).await {
                    Ok(partition) => {
                        self.store
                            .commit_transform(run_id, owner, &partition)
                            .await?;
                        partition
                    }
                    Err(StepError::Shutdown) => {
                        self.store.release(run_id, owner).await?;
                        return Ok(RunOutcome::Released);
                    }
                    Err(StepError::LostOwnership) => return Ok(RunOutcome::LostOwnership),
                    Err(e) => return self.close(run_id, e.status(), e.to_string()).await,
                }
            }
            IngestState::Recording => match &run.partition {
                Some(partition) => {
                    info!(partition = %partition.name, "resuming with committed transform output");
                    partition.clone()
                }
                None => {
                    return self
                        .close(
                            run_id,
                            RunStatus::Failed,
                            "run is recording without a committed transform output".into(),
                        )
                        .await
                }
            },
            state @ (IngestState::Completed | IngestState::Failed | IngestState::Canceled) => {
                return self
                    .close(
                        run_id,
                        RunStatus::Failed,
                        format!("running run in terminal state {state}"),
                    )
                    .await
            }
        };

        if shutdown.is_cancelled() {
            self.store.release(run_id, owner).await?;
            return Ok(RunOutcome::Released);
        }
        // also refreshes the claim ahead of the catalog call
        if self.store.heartbeat(run_id, owner).await? {
            return self
                .close(run_id, RunStatus::Canceled, "canceled on request".into())
                .await;
        }

        // Once dispatched, the catalog call is not interrupted by cancellation.
        match tokio::time::timeout(
            self.config.record_timeout,
            self.record_step(&partition, resumed),
        )
        .await
        {
            Ok(Ok(())) => {
                self.store.complete(run_id, owner).await?;
                info!(
                    partition = %partition.name,
                    time_range = %partition.time_range,
                    "partition recorded"
                );
                Ok(RunOutcome::Closed(RunStatus::Completed))
            }
            Ok(Err(e)) => self.close(run_id, RunStatus::Failed, e.to_string()).await,
            Err(_) => {
                self.close(
                    run_id,
                    RunStatus::TimedOut,
                    format!(
                        "record step timed out after {:?}",
                        self.config.record_timeout
                    ),
                )
                .await
            }
        }
    }

    async fn close(&self, run_id: RunId, status: RunStatus, failure: String) -> Result<RunOutcome> {
        warn!(%status, %failure, "closing run");
        self.store
            .close(run_id, self.owner(), status, Some(failure))
            .await?;
        Ok(RunOutcome::Closed(status))
    }

    /// Record the partition. A resumed run may have committed it before the worker went away, in
    /// which case the conflict is the expected outcome.
    async fn record_step(&self, partition: &Partition, resumed: bool) -> Result<(), ActivityError> {
        match self.activities.record_partition(partition).await {
            Err(ActivityError::Catalog(CatalogError::AlreadyExists { descr })) if resumed => {
                if self.activities.partition_recorded(partition).await? {
                    info!(partition = %partition.name, "partition already recorded");
                    Ok(())
                } else {
                    Err(CatalogError::AlreadyExists { descr }.into())
                }
            }
            res => res,
        }
    }

    async fn transform_step(
        &self,
        run: &WorkflowRun,
        shutdown: &CancellationToken,
    ) -> Result<Partition, StepError> {
        let request = run.request.transform_request();
        let started = Instant::now();
        let deadline = started + self.config.step_timeout;
        let heartbeat_timeout = self.config.heartbeat_timeout;

        let (beats, mut beat_rx) = watch::channel(started);
        let heartbeat = StepHeartbeat { beats };
        let cancel = CancellationToken::new();

        let activity = self.activities.transform(&request, &heartbeat, &cancel);
        tokio::pin!(activity);

        let mut last_beat = started;
        let interrupted = loop {
            tokio::select! {
                biased;

                res = &mut activity => return res.map_err(StepError::Activity),
                _ = shutdown.cancelled() => break StepError::Shutdown,
                _ = sleep_until(deadline) => break StepError::StepTimeout(self.config.step_timeout),
                _ = sleep_until(last_beat + heartbeat_timeout) => {
                    break StepError::HeartbeatTimeout(heartbeat_timeout)
                }
                Ok(()) = beat_rx.changed() => {
                    last_beat = *beat_rx.borrow_and_update();
                    match self.store.heartbeat(run.run_id, self.owner()).await {
                        Ok(false) => {}
                        Ok(true) => break StepError::CancelRequested,
                        Err(Error::LostOwnership { .. }) => break StepError::LostOwnership,
                        Err(e) => warn!(%e, "failed to record heartbeat"),
                    }
                }
            }
        };

        // The activity kills its child before it returns.
        cancel.cancel();
        let res = activity.await;
        debug!(?res, reason = %interrupted, "transform step interrupted");
        Err(interrupted)
    }
}
